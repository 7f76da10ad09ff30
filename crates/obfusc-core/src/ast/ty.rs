//! Type descriptors for the C-like source language.
//!
//! Types are kept to the precision the analyses need: integer kinds carry
//! enough information for promotion/conversion decisions and the
//! integer-vs-real split, while aggregates are represented by tag name only.

use crate::ast::expr::Expr;

/// Integer type kinds, ordered by conversion rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntKind {
    Bool,
    Char,
    SChar,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    LongLong,
    ULongLong,
}

impl IntKind {
    /// Conversion rank per the usual arithmetic conversion rules. `Bool` is
    /// lowest; signed/unsigned pairs share a rank.
    pub fn rank(self) -> u8 {
        match self {
            IntKind::Bool => 0,
            IntKind::Char | IntKind::SChar | IntKind::UChar => 1,
            IntKind::Short | IntKind::UShort => 2,
            IntKind::Int | IntKind::UInt => 3,
            IntKind::Long | IntKind::ULong => 4,
            IntKind::LongLong | IntKind::ULongLong => 5,
        }
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            IntKind::Bool | IntKind::UChar | IntKind::UShort | IntKind::UInt | IntKind::ULong | IntKind::ULongLong
        )
    }

    /// Integer promotion: everything below `int` rank promotes to `int`.
    pub fn promoted(self) -> IntKind {
        if self.rank() < IntKind::Int.rank() {
            IntKind::Int
        } else {
            self
        }
    }
}

/// Real (floating) type kinds, ordered by width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RealKind {
    Float,
    Double,
    LongDouble,
}

/// A type descriptor for declarations, parameters, and casts.
#[derive(Debug, Clone, PartialEq)]
pub enum CType {
    Void,
    Int(IntKind),
    Real(RealKind),
    /// A typedef name; resolved through the scope analysis when needed.
    Named(String),
    Pointer(Box<CType>),
    /// `len` is `None` for unsized arrays (`int a[] = {...}`); a length
    /// expression containing identifiers makes this a variable-length array.
    Array {
        elem: Box<CType>,
        len: Option<Box<Expr>>,
    },
    /// Struct or union, by tag.
    Record(String),
    Enum(String),
    Function {
        ret: Box<CType>,
        params: Vec<CType>,
        variadic: bool,
    },
}

impl CType {
    pub fn int() -> CType {
        CType::Int(IntKind::Int)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, CType::Int(_) | CType::Enum(_))
    }

    pub fn is_real(&self) -> bool {
        matches!(self, CType::Real(_))
    }

    pub fn is_arithmetic(&self) -> bool {
        self.is_integer() || self.is_real()
    }

    pub fn is_array(&self) -> bool {
        matches!(self, CType::Array { .. })
    }

    /// True when this is an array whose length expression references any
    /// identifier, i.e. a variable-length array whose size is only known at
    /// the original declaration point.
    pub fn is_vla(&self) -> bool {
        match self {
            CType::Array { elem, len } => {
                len.as_deref().map(Expr::references_identifiers).unwrap_or(false)
                    || elem.is_vla()
            }
            _ => false,
        }
    }

    /// The element type of a (possibly nested) array, or `self` otherwise.
    pub fn array_element(&self) -> &CType {
        match self {
            CType::Array { elem, .. } => elem.array_element(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::expr::Expr;

    #[test]
    fn promotion_lifts_small_ints() {
        assert_eq!(IntKind::Char.promoted(), IntKind::Int);
        assert_eq!(IntKind::UShort.promoted(), IntKind::Int);
        assert_eq!(IntKind::ULong.promoted(), IntKind::ULong);
    }

    #[test]
    fn vla_requires_identifier_in_length() {
        let fixed = CType::Array {
            elem: Box::new(CType::int()),
            len: Some(Box::new(Expr::IntLit(8))),
        };
        assert!(!fixed.is_vla());

        let vla = CType::Array {
            elem: Box::new(CType::int()),
            len: Some(Box::new(Expr::Ident("n".into()))),
        };
        assert!(vla.is_vla());
    }
}
