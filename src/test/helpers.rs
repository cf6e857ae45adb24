use crate::{
    il::{body::MethodBody, decoder::decode_stream, instruction::Instruction},
    utils::parser::Parser,
};

/// Parse a complete body and decode its code.
pub fn decode_body(body: &[u8]) -> (MethodBody, Vec<Instruction>) {
    let header = MethodBody::from(body).unwrap();
    let instructions = decode_stream(&mut Parser::new(header.code(body).unwrap())).unwrap();
    (header, instructions)
}
