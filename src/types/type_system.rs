//! Type System for og
//!
//! Types are structural: two tuples are the same type when their
//! components are, and a 1-component tuple is its component.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Size of an `int`, a `string` (address) and any pointer, in bytes
pub const WORD_SIZE: u32 = 4;
/// Size of a `double`, in bytes
pub const DOUBLE_SIZE: u32 = 8;

/// Resolved type of a node or symbol
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Type {
    Void,
    Int,
    Double,
    String,
    Pointer(Box<Type>),
    /// Tuple of component types
    Struct(Vec<Type>),
    /// `auto`: to be inferred from an initializer or a return
    #[serde(rename = "auto")]
    Unspec,
}

impl Type {
    pub fn pointer(referenced: Type) -> Self {
        Self::Pointer(Box::new(referenced))
    }

    /// The type of `nullptr`
    pub fn generic_pointer() -> Self {
        Self::pointer(Type::Void)
    }

    /// Size in bytes
    pub fn size(&self) -> u32 {
        match self {
            Self::Void | Self::Unspec => 0,
            Self::Int | Self::String | Self::Pointer(_) => WORD_SIZE,
            Self::Double => DOUBLE_SIZE,
            Self::Struct(components) => components.iter().map(Type::size).sum(),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int | Self::Double)
    }

    pub fn is_struct(&self) -> bool {
        matches!(self, Self::Struct(_))
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Self::Pointer(_))
    }

    /// Referenced type of a pointer
    pub fn referenced(&self) -> Option<&Type> {
        match self {
            Self::Pointer(inner) => Some(inner),
            _ => None,
        }
    }

    pub fn components(&self) -> &[Type] {
        match self {
            Self::Struct(components) => components,
            _ => std::slice::from_ref(self),
        }
    }

    /// Whether an `auto` placeholder survives anywhere inside this type
    pub fn contains_unspec(&self) -> bool {
        match self {
            Self::Unspec => true,
            Self::Pointer(inner) => inner.contains_unspec(),
            Self::Struct(components) => components.iter().any(Type::contains_unspec),
            _ => false,
        }
    }

    /// Non-tuple leaves in declaration order (nested tuples are flattened)
    pub fn leaves(&self) -> Vec<&Type> {
        match self {
            Self::Struct(components) => components.iter().flat_map(Type::leaves).collect(),
            other => vec![other],
        }
    }

    /// Leaves paired with their byte offsets, lowest address first
    pub fn leaf_offsets(&self) -> Vec<(&Type, u32)> {
        let mut leaves = Vec::new();
        self.collect_leaves(0, &mut leaves);
        leaves
    }

    fn collect_leaves<'t>(&'t self, base: u32, leaves: &mut Vec<(&'t Type, u32)>) {
        match self {
            Self::Struct(components) => {
                let mut offset = base;
                for component in components {
                    component.collect_leaves(offset, leaves);
                    offset += component.size();
                }
            }
            other => leaves.push((other, base)),
        }
    }

    /// Byte offset of the 1-based component `index`.
    ///
    /// A flattened tuple is pushed last component first, so component 1
    /// sits on top of the stack. The offset of a component is the size of
    /// everything pushed after it, i.e. of the components before it.
    pub fn component_offset(&self, index: usize) -> Option<u32> {
        let components = match self {
            Self::Struct(components) => components,
            _ => return None,
        };
        if index == 0 || index > components.len() {
            return None;
        }
        Some(components[..index - 1].iter().map(Type::size).sum())
    }

    /// Pointer arithmetic step: the referenced size, bytes for `ptr<void>`
    pub fn pointer_step(&self) -> u32 {
        self.referenced().map(|t| t.size().max(1)).unwrap_or(1)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => write!(f, "void"),
            Self::Int => write!(f, "int"),
            Self::Double => write!(f, "double"),
            Self::String => write!(f, "string"),
            Self::Unspec => write!(f, "auto"),
            Self::Pointer(inner) => write!(f, "ptr<{}>", inner),
            Self::Struct(components) => {
                write!(f, "(")?;
                for (i, c) in components.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", c)?;
                }
                write!(f, ")")
            }
        }
    }
}

// ==================== Compatibility ====================

/// Independent knobs of the unification function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompatOptions {
    /// `int` on the left unifies with `double` on the right
    pub accept_int_to_double: bool,
    /// `double` on the left accepts an `int` on the right
    pub accept_double_from_int: bool,
    /// `auto` unifies with whatever the other side is
    pub accept_unspecified: bool,
    /// `ptr<void>` unifies with any pointer
    pub allow_pointer_void_coercion: bool,
    /// disagreeing pointees generalize to `ptr<void>`
    pub generalize_pointers: bool,
}

impl CompatOptions {
    /// Binary operators: symmetric int/double promotion
    pub const DEFAULT: Self = Self {
        accept_int_to_double: true,
        accept_double_from_int: true,
        accept_unspecified: false,
        allow_pointer_void_coercion: false,
        generalize_pointers: false,
    };

    /// Rvalue into an existing lvalue: widening only
    pub const ASSIGNMENT: Self = Self {
        accept_int_to_double: false,
        accept_double_from_int: true,
        accept_unspecified: false,
        allow_pointer_void_coercion: true,
        generalize_pointers: false,
    };

    /// Declared type against initializer: may fill `auto`
    pub const INITIALIZER: Self = Self {
        accept_int_to_double: false,
        accept_double_from_int: true,
        accept_unspecified: true,
        allow_pointer_void_coercion: true,
        generalize_pointers: false,
    };

    /// Return type inference across the returns of an `auto` function
    pub const GENERALIZE: Self = Self {
        accept_int_to_double: true,
        accept_double_from_int: true,
        accept_unspecified: true,
        allow_pointer_void_coercion: true,
        generalize_pointers: true,
    };

    /// Pointees unify without numeric promotion
    fn through_pointer(self) -> Self {
        Self {
            accept_int_to_double: false,
            accept_double_from_int: false,
            ..self
        }
    }
}

/// Unify `left` (declared/destination side) with `right` (value side).
///
/// Returns the unified type, or `None` when the types are incompatible
/// under `options`. Callers turn `None` into a type error.
pub fn compatible(left: &Type, right: &Type, options: CompatOptions) -> Option<Type> {
    if let Type::Struct(components) = left {
        if components.len() == 1 {
            return compatible(&components[0], right, options);
        }
    }
    if let Type::Struct(components) = right {
        if components.len() == 1 {
            return compatible(left, &components[0], options);
        }
    }

    match (left, right) {
        (Type::Unspec, other) | (other, Type::Unspec) if options.accept_unspecified => {
            Some(other.clone())
        }
        (Type::Void, Type::Void) => Some(Type::Void),
        (Type::Int, Type::Int) => Some(Type::Int),
        (Type::Double, Type::Double) => Some(Type::Double),
        (Type::String, Type::String) => Some(Type::String),
        (Type::Int, Type::Double) if options.accept_int_to_double => Some(Type::Double),
        (Type::Double, Type::Int) if options.accept_double_from_int => Some(Type::Double),
        (Type::Pointer(a), Type::Pointer(b)) => compatible_pointees(a, b, options),
        (Type::Struct(a), Type::Struct(b)) if a.len() == b.len() => a
            .iter()
            .zip(b)
            .map(|(x, y)| compatible(x, y, options))
            .collect::<Option<Vec<_>>>()
            .map(Type::Struct),
        _ => None,
    }
}

fn compatible_pointees(left: &Type, right: &Type, options: CompatOptions) -> Option<Type> {
    if options.allow_pointer_void_coercion {
        if *left == Type::Void {
            return Some(Type::pointer(right.clone()));
        }
        if *right == Type::Void {
            return Some(Type::pointer(left.clone()));
        }
    }
    match compatible(left, right, options.through_pointer()) {
        Some(inner) => Some(Type::pointer(inner)),
        None if options.generalize_pointers => Some(Type::generic_pointer()),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tuple(items: &[Type]) -> Type {
        Type::Struct(items.to_vec())
    }

    #[test]
    fn test_sizes() {
        assert_eq!(Type::Int.size(), 4);
        assert_eq!(Type::Double.size(), 8);
        assert_eq!(Type::String.size(), 4);
        assert_eq!(Type::pointer(Type::Double).size(), 4);
        assert_eq!(tuple(&[Type::Int, Type::Double, tuple(&[Type::String, Type::Double])]).size(), 24);
    }

    #[test]
    fn test_single_component_tuple_degrades_both_ways() {
        let candidates = [
            Type::Int,
            Type::Double,
            Type::String,
            Type::generic_pointer(),
            tuple(&[Type::Int, Type::Double]),
        ];
        for t in candidates {
            let wrapped = tuple(&[t.clone()]);
            for options in [CompatOptions::DEFAULT, CompatOptions::ASSIGNMENT, CompatOptions::INITIALIZER] {
                assert_eq!(compatible(&wrapped, &t, options), Some(t.clone()));
                assert_eq!(compatible(&t, &wrapped, options), Some(t.clone()));
            }
        }
    }

    #[test]
    fn test_promotion_asymmetry() {
        assert_eq!(compatible(&Type::Double, &Type::Int, CompatOptions::ASSIGNMENT), Some(Type::Double));
        assert_eq!(compatible(&Type::Int, &Type::Double, CompatOptions::ASSIGNMENT), None);
        assert_eq!(compatible(&Type::Int, &Type::Double, CompatOptions::DEFAULT), Some(Type::Double));
        assert_eq!(compatible(&Type::Double, &Type::Int, CompatOptions::DEFAULT), Some(Type::Double));
    }

    #[test]
    fn test_unspecified_fills_only_when_accepted() {
        assert_eq!(compatible(&Type::Unspec, &Type::String, CompatOptions::INITIALIZER), Some(Type::String));
        assert_eq!(compatible(&Type::Unspec, &Type::String, CompatOptions::ASSIGNMENT), None);
    }

    #[test]
    fn test_generic_pointer_coercion() {
        let int_ptr = Type::pointer(Type::Int);
        let null = Type::generic_pointer();
        assert_eq!(compatible(&int_ptr, &null, CompatOptions::ASSIGNMENT), Some(int_ptr.clone()));
        assert_eq!(compatible(&null, &int_ptr, CompatOptions::ASSIGNMENT), Some(int_ptr.clone()));
        assert_eq!(compatible(&int_ptr, &null, CompatOptions::DEFAULT), None);
    }

    #[test]
    fn test_no_promotion_through_pointers() {
        let int_ptr = Type::pointer(Type::Int);
        let double_ptr = Type::pointer(Type::Double);
        assert_eq!(compatible(&double_ptr, &int_ptr, CompatOptions::DEFAULT), None);
        assert_eq!(compatible(&double_ptr, &int_ptr, CompatOptions::GENERALIZE), Some(Type::generic_pointer()));
    }

    #[test]
    fn test_struct_lengths_must_match() {
        let pair = tuple(&[Type::Int, Type::Int]);
        let triple = tuple(&[Type::Int, Type::Int, Type::Int]);
        assert_eq!(compatible(&pair, &triple, CompatOptions::DEFAULT), None);
        assert_eq!(
            compatible(&tuple(&[Type::Double, Type::Int]), &pair, CompatOptions::ASSIGNMENT),
            Some(tuple(&[Type::Double, Type::Int]))
        );
    }

    #[test]
    fn test_component_offsets() {
        let t = tuple(&[Type::Int, Type::Double, Type::String]);
        assert_eq!(t.component_offset(1), Some(0));
        assert_eq!(t.component_offset(2), Some(4));
        assert_eq!(t.component_offset(3), Some(12));
        assert_eq!(t.component_offset(0), None);
        assert_eq!(t.component_offset(4), None);
    }

    #[test]
    fn test_leaves_flatten_nested_tuples() {
        let t = tuple(&[Type::Int, tuple(&[Type::Double, Type::String])]);
        assert_eq!(t.leaves(), vec![&Type::Int, &Type::Double, &Type::String]);
        assert_eq!(t.to_string(), "(int, (double, string))");
        assert_eq!(
            t.leaf_offsets(),
            vec![(&Type::Int, 0), (&Type::Double, 4), (&Type::String, 12)]
        );
    }
}
