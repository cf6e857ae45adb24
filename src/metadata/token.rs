//! Metadata token type.
//!
//! A token is a 32-bit reference into one of a module's metadata tables: the high byte names
//! the table and the low 24 bits the 1-based row. The rewriter embeds tokens as call and
//! `catch` operands, and the emitter hands out freshly defined ones.
//!
//! # Examples
//!
//! ```rust
//! use dotweave::Token;
//!
//! let token = Token::new(0x0A00_0007);
//! assert_eq!(token.table(), Token::MEMBER_REF_TABLE);
//! assert_eq!(token.row(), 7);
//! assert_eq!(token, Token::from_parts(Token::MEMBER_REF_TABLE, 7));
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};

/// A metadata token: table identifier in the high byte, row index in the low 24 bits.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Token(pub u32);

impl Token {
    /// `TypeRef` table identifier
    pub const TYPE_REF_TABLE: u8 = 0x01;
    /// `TypeDef` table identifier
    pub const TYPE_DEF_TABLE: u8 = 0x02;
    /// `MethodDef` table identifier
    pub const METHOD_DEF_TABLE: u8 = 0x06;
    /// `MemberRef` table identifier
    pub const MEMBER_REF_TABLE: u8 = 0x0A;
    /// `StandAloneSig` table identifier
    pub const STANDALONE_SIG_TABLE: u8 = 0x11;
    /// `TypeSpec` table identifier
    pub const TYPE_SPEC_TABLE: u8 = 0x1B;
    /// `AssemblyRef` table identifier
    pub const ASSEMBLY_REF_TABLE: u8 = 0x23;
    /// `MethodSpec` table identifier
    pub const METHOD_SPEC_TABLE: u8 = 0x2B;
    /// User string heap pseudo-table (`ldstr` operands)
    pub const USER_STRING: u8 = 0x70;

    /// Creates a new token from its raw value.
    #[must_use]
    pub fn new(value: u32) -> Self {
        Token(value)
    }

    /// Creates a token from a table identifier and a row index.
    #[must_use]
    pub fn from_parts(table: u8, row: u32) -> Self {
        Token((u32::from(table) << 24) | (row & 0x00FF_FFFF))
    }

    /// Returns the raw 32-bit value.
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Returns the table identifier (high byte).
    #[must_use]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Returns the row index (low 24 bits).
    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Returns `true` for the null token.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if the token can be the operand of `call`/`callvirt`/`newobj`.
    #[must_use]
    pub fn is_method_like(&self) -> bool {
        matches!(
            self.table(),
            Self::METHOD_DEF_TABLE | Self::MEMBER_REF_TABLE | Self::METHOD_SPEC_TABLE
        )
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl Hash for Token {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_token_parts() {
        let token = Token::from_parts(Token::METHOD_DEF_TABLE, 0x2A);
        assert_eq!(token.value(), 0x0600_002A);
        assert_eq!(token.table(), 0x06);
        assert_eq!(token.row(), 0x2A);
    }

    #[test]
    fn test_token_row_is_masked() {
        let token = Token::from_parts(Token::MEMBER_REF_TABLE, 0x0100_0001);
        assert_eq!(token.value(), 0x0A00_0001);
    }

    #[test]
    fn test_token_is_null() {
        assert!(Token::default().is_null());
        assert!(!Token(0x0A00_0001).is_null());
    }

    #[test]
    fn test_token_is_method_like() {
        assert!(Token(0x0600_0001).is_method_like());
        assert!(Token(0x0A00_0001).is_method_like());
        assert!(Token(0x2B00_0001).is_method_like());
        assert!(!Token(0x0100_0001).is_method_like());
        assert!(!Token(0x7000_0001).is_method_like());
    }

    #[test]
    fn test_token_display_and_debug() {
        let token = Token(0x0A00_0003);
        assert_eq!(format!("{}", token), "0x0a000003");

        let debug_str = format!("{:?}", token);
        assert!(debug_str.contains("table: 0x0a"));
        assert!(debug_str.contains("row: 3"));
    }

    #[test]
    fn test_token_hash_and_order() {
        let mut set = HashSet::new();
        set.insert(Token(0x0600_0001));
        set.insert(Token(0x0600_0001));
        set.insert(Token(0x0600_0002));
        assert_eq!(set.len(), 2);

        assert!(Token(0x0600_0001) < Token(0x0600_0002));
        assert!(Token(0x0600_FFFF) < Token(0x0A00_0001));
    }
}
