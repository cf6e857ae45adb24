//! End-to-end tests of the body rewriter: rewritten methods are executed by a small interpreter
//! and compared against the originals.

mod common;

use dotweave::{
    il::{
        decoder::decode_stream, verify::verify, ExceptionHandlerFlags, Instruction, OpCode,
    },
    prelude::*,
    Parser,
};

use common::{
    fat_body,
    interpreter::{run, Completion, Value},
    tiny_body, RecordingHost, TestTokens,
};

const METHOD: Token = Token(0x0600_0001);
const LOCALS: Token = Token(0x1100_0005);

struct Program {
    body: Vec<u8>,
    signature: MethodSignature,
    locals: Vec<u8>,
}

impl Program {
    fn request(&self, policy: InstrumentationPolicy) -> RewriteRequest<'_> {
        RewriteRequest {
            method_token: METHOD,
            body: &self.body,
            signature: &self.signature,
            locals: &self.locals,
            is_constructor: false,
            policy,
        }
    }

    fn returns_value(&self) -> bool {
        !self.signature.ret.is_void()
    }
}

fn int_method(params: usize) -> MethodSignature {
    MethodSignature::static_method(TypeSig::I4, vec![TypeSig::I4; params])
}

/// `static int Add(int a, int b) => a + b;`
fn add() -> Program {
    Program {
        body: fat_body(&[0x02, 0x03, 0x58, 0x2A], 2, &[]),
        signature: int_method(2),
        locals: Vec::new(),
    }
}

/// `static int Sign(int x)` with three `ret` instructions.
fn sign() -> Program {
    #[rustfmt::skip]
    let code = [
        0x02,             // ldarg.0
        0x2D, 0x02,       // brtrue.s IL_0005
        0x16,             // ldc.i4.0
        0x2A,             // ret
        0x02,             // IL_0005: ldarg.0
        0x16,             // ldc.i4.0
        0x30, 0x02,       // bgt.s IL_000b
        0x15,             // ldc.i4.m1
        0x2A,             // ret
        0x17,             // IL_000b: ldc.i4.1
        0x2A,             // ret
    ];
    Program {
        body: fat_body(&code, 2, &[]),
        signature: int_method(1),
        locals: Vec::new(),
    }
}

/// `static int Pick(int x)`: a `switch` over three cases.
fn pick() -> Program {
    #[rustfmt::skip]
    let code = [
        0x02,                               // ldarg.0
        0x45, 0x02, 0x00, 0x00, 0x00,       // switch (IL_0010, IL_0013)
        0x02, 0x00, 0x00, 0x00,
        0x05, 0x00, 0x00, 0x00,
        0x2B, 0x06,                         // br.s IL_0016
        0x1F, 0x0A, 0x2A,                   // IL_0010: ldc.i4.s 10; ret
        0x1F, 0x14, 0x2A,                   // IL_0013: ldc.i4.s 20; ret
        0x1F, 0x1E, 0x2A,                   // IL_0016: ldc.i4.s 30; ret
    ];
    Program {
        body: fat_body(&code, 1, &[]),
        signature: int_method(1),
        locals: Vec::new(),
    }
}

/// `static void Boom() => Fail();`
fn boom() -> Program {
    Program {
        body: tiny_body(&[0x28, 0x10, 0x00, 0x00, 0x0A, 0x2A]),
        signature: MethodSignature::static_method(TypeSig::Void, vec![]),
        locals: Vec::new(),
    }
}

/// `static int Guard() { try { Fail(); } catch { return 1; } return 0; }`
fn guard() -> Program {
    #[rustfmt::skip]
    let code = [
        0x28, 0x10, 0x00, 0x00, 0x0A,   // call Fail
        0xDE, 0x05,                     // leave.s IL_000c
        0x26,                           // IL_0007: pop
        0x17,                           // ldc.i4.1
        0x0A,                           // stloc.0
        0xDE, 0x02,                     // leave.s IL_000e
        0x16,                           // IL_000c: ldc.i4.0
        0x0A,                           // stloc.0
        0x06,                           // IL_000e: ldloc.0
        0x2A,                           // ret
    ];
    let clauses = [ExceptionHandler::catch(0, 7, 7, 5, TestTokens::OBJECT)];
    Program {
        body: MethodBodyWriter::new(&code)
            .max_stack(1)
            .local_signature(Some(LOCALS))
            .init_locals(true)
            .exception_handlers(&clauses)
            .build()
            .unwrap(),
        signature: int_method(0),
        locals: vec![0x07, 0x01, 0x08],
    }
}

/// A method whose short forward branch no longer fits once its returns are rewritten.
fn ladder(blocks: u8) -> Program {
    let mut code = vec![0x02, 0x1F, 0x64, 0x2F, blocks * 8];
    for k in 0..blocks {
        // ldarg.0; ldc.i4.s k; bne.un.s +3; ldc.i4.s k; ret
        code.extend_from_slice(&[0x02, 0x1F, k, 0x33, 0x03, 0x1F, k, 0x2A]);
    }
    code.extend_from_slice(&[0x15, 0x2A]);
    Program {
        body: fat_body(&code, 2, &[]),
        signature: int_method(1),
        locals: Vec::new(),
    }
}

fn rewrite(program: &Program, policy: InstrumentationPolicy) -> RewrittenMethod {
    match Rewriter::default()
        .rewrite(&program.request(policy), &TestTokens)
        .unwrap()
    {
        RewriteOutcome::Rewritten(rewritten) => rewritten,
        RewriteOutcome::AlreadyInstrumented => panic!("fresh body reported as instrumented"),
    }
}

fn verify_full(program: &Program, body: &[u8]) {
    let options = VerifyOptions {
        returns_value: program.returns_value(),
        resolver: Some(&TestTokens),
    };
    verify(body, &options).unwrap();
}

fn decode(body: &[u8]) -> (MethodBody, Vec<Instruction>) {
    let header = MethodBody::from(body).unwrap();
    let instructions = decode_stream(&mut Parser::new(header.code(body).unwrap())).unwrap();
    (header, instructions)
}

/// Run both bodies and check the rewritten one behaves identically, calling each helper once.
fn assert_transparent(program: &Program, rewritten: &[u8], args: &[Value]) -> RecordingHost {
    let mut plain = RecordingHost::new();
    let expected = run(&program.body, args, &mut plain);

    let mut host = RecordingHost::new();
    let actual = run(rewritten, args, &mut host);

    assert_eq!(actual, expected, "args {args:?}");
    assert_eq!(host.enters, vec![i64::from(METHOD.value())]);
    assert_eq!(host.exits.len(), 1, "exit helper must run exactly once");

    let exit = &host.exits[0];
    let (correlation, exception) = (exit[exit.len() - 1], exit[exit.len() - 2]);
    assert_eq!(correlation, Value::Int(1001));
    match expected {
        Completion::Returned(value) => {
            assert_eq!(exception, Value::Null);
            if let Some(value) = value {
                assert_eq!(exit[0], value);
            }
        }
        Completion::Threw(thrown) => assert_eq!(exception, thrown),
    }
    host
}

#[test]
fn add_reports_its_result() -> Result<()> {
    common::init_tracing();

    let program = add();
    let rewritten = rewrite(&program, InstrumentationPolicy::all());
    verify_full(&program, &rewritten.body);

    let host = assert_transparent(&program, &rewritten.body, &[Value::Int(2), Value::Int(3)]);
    assert_eq!(
        host.exits[0],
        vec![Value::Int(5), Value::Null, Value::Int(1001)]
    );

    // ldloc ret, ldloc exc, ldloc corr
    assert_eq!(rewritten.max_stack, 3);
    assert_eq!(rewritten.locals_token, TestTokens::LOCALS);

    let (header, _) = decode(&rewritten.body);
    assert!(header.is_fat);
    assert!(header.is_init_local);
    assert_eq!(header.local_signature(), Some(TestTokens::LOCALS));
    assert_eq!(header.exception_handlers.len(), 2);
    assert_eq!(
        header.exception_handlers[0].class_token(),
        Some(TestTokens::OBJECT)
    );
    assert!(header.exception_handlers[1].is_finally_like());
    Ok(())
}

#[test]
fn every_return_path_fires_exit_once() {
    let program = sign();
    let rewritten = rewrite(&program, InstrumentationPolicy::all());
    verify_full(&program, &rewritten.body);

    for (input, output) in [(-5, -1), (0, 0), (7, 1)] {
        let host = assert_transparent(&program, &rewritten.body, &[Value::Int(input)]);
        assert_eq!(host.exits[0][0], Value::Int(output));
    }
}

#[test]
fn switch_targets_are_relocated() {
    let program = pick();
    let rewritten = rewrite(&program, InstrumentationPolicy::all());
    verify_full(&program, &rewritten.body);

    for input in [0, 1, 2, -1] {
        assert_transparent(&program, &rewritten.body, &[Value::Int(input)]);
    }

    // ldc.i4 <token> (5) + call Enter (5) + stloc.2 (1)
    assert_eq!(rewritten.offset_map[&0], 11);

    let (_, original) = decode(&program.body);
    let (_, instructions) = decode(&rewritten.body);
    for instruction in &original {
        let moved = rewritten.offset_map[&instruction.offset];
        let relocated = instructions
            .iter()
            .find(|candidate| candidate.offset == moved)
            .unwrap();
        if instruction.opcode == OpCode::RET {
            assert!(relocated.stored_local().is_some());
        } else {
            assert_eq!(
                relocated.opcode.long_form(),
                instruction.opcode.long_form()
            );
        }
    }
}

#[test]
fn thrown_exceptions_reach_the_exit_helper() {
    let program = boom();
    let rewritten = rewrite(&program, InstrumentationPolicy::all());
    verify_full(&program, &rewritten.body);

    let host = assert_transparent(&program, &rewritten.body, &[]);
    assert_eq!(host.exits[0], vec![Value::Object(7), Value::Int(1001)]);

    // A tiny original reports the tiny header's implicit depth
    assert_eq!(rewritten.max_stack, 8);
}

#[test]
fn handled_exceptions_stay_inside_the_method() {
    let program = guard();
    let rewritten = rewrite(&program, InstrumentationPolicy::all());
    verify_full(&program, &rewritten.body);

    let host = assert_transparent(&program, &rewritten.body, &[]);
    assert_eq!(
        host.exits[0],
        vec![Value::Int(1), Value::Null, Value::Int(1001)]
    );

    // The original clause stays first, inside the synthesized ones
    let (header, _) = decode(&rewritten.body);
    assert_eq!(header.exception_handlers.len(), 3);
    let original = header.exception_handlers[0];
    assert_eq!(original.class_token(), Some(TestTokens::OBJECT));
    let outer = header.exception_handlers[2];
    assert!(outer.try_contains(original.try_offset));
    assert!(outer.try_contains(original.handler_end() - 1));
}

#[test]
fn entry_only_keeps_the_body_shape() {
    let program = add();
    let rewritten = rewrite(&program, InstrumentationPolicy::ENTRY);
    verify_full(&program, &rewritten.body);

    let mut host = RecordingHost::new();
    let result = run(&rewritten.body, &[Value::Int(40), Value::Int(2)], &mut host);
    assert_eq!(result, Completion::Returned(Some(Value::Int(42))));
    assert_eq!(host.enters.len(), 1);
    assert!(host.exits.is_empty());

    let (header, _) = decode(&rewritten.body);
    assert!(header.exception_handlers.is_empty());
}

#[test]
fn growing_bodies_promote_short_branches() {
    let program = ladder(15);
    let rewritten = rewrite(&program, InstrumentationPolicy::all());
    verify_full(&program, &rewritten.body);
    assert!(rewritten.layout_passes > 1);

    for input in [0, 7, 14, 15, 200] {
        assert_transparent(&program, &rewritten.body, &[Value::Int(input)]);
    }

    let result = Rewriter::new(1).rewrite(
        &program.request(InstrumentationPolicy::all()),
        &TestTokens,
    );
    match result {
        Err(error @ Error::NonConvergentLayout(1)) => assert!(error.is_decline()),
        other => panic!("expected a layout failure, got {other:?}"),
    }
}

#[test]
fn rewriting_is_idempotent() {
    let program = sign();
    let rewritten = rewrite(&program, InstrumentationPolicy::all());

    let again = Program {
        body: rewritten.body.clone(),
        signature: program.signature.clone(),
        locals: Vec::new(),
    };
    let outcome = Rewriter::default()
        .rewrite(&again.request(InstrumentationPolicy::all()), &TestTokens)
        .unwrap();
    assert_eq!(outcome, RewriteOutcome::AlreadyInstrumented);
}

#[test]
fn filters_are_declined() {
    #[rustfmt::skip]
    let code = [
        0x28, 0x10, 0x00, 0x00, 0x0A,   // call Fail
        0xDE, 0x07,                     // leave.s IL_000e
        0x26, 0x17, 0xFE, 0x11,         // IL_0007: pop; ldc.i4.1; endfilter
        0x26, 0xDE, 0x00,               // IL_000b: pop; leave.s IL_000e
        0x2A,                           // IL_000e: ret
    ];
    let clauses = [ExceptionHandler {
        flags: ExceptionHandlerFlags::FILTER,
        try_offset: 0,
        try_length: 7,
        handler_offset: 0x0B,
        handler_length: 3,
        class_or_filter: 7,
    }];
    let program = Program {
        body: fat_body(&code, 1, &clauses),
        signature: MethodSignature::static_method(TypeSig::Void, vec![]),
        locals: Vec::new(),
    };

    let error = Rewriter::default()
        .rewrite(&program.request(InstrumentationPolicy::all()), &TestTokens)
        .unwrap_err();
    assert!(matches!(error, Error::UnsupportedMethodShape(_)));
    assert!(error.is_decline());
}

#[test]
fn constructors_only_get_entry_calls() {
    let program = Program {
        body: tiny_body(&[0x02, 0x28, 0x20, 0x00, 0x00, 0x0A, 0x2A]),
        signature: MethodSignature::static_method(TypeSig::Void, vec![]),
        locals: Vec::new(),
    };
    let mut request = program.request(InstrumentationPolicy::all());
    request.is_constructor = true;

    let error = Rewriter::default().rewrite(&request, &TestTokens).unwrap_err();
    assert!(error.is_decline());

    request.policy = InstrumentationPolicy::ENTRY;
    assert!(matches!(
        Rewriter::default().rewrite(&request, &TestTokens),
        Ok(RewriteOutcome::Rewritten(_))
    ));
}
