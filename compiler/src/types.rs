// types.rs — Weft type model
//
// Futures of primitive type, updateables, arrays, structs, references,
// unions (used for untyped integer literals), function types and named
// sub-types. All queries look through sub-types to the underlying type.
//
// Preconditions: none.
// Postconditions: assignability is reflexive; a sub-type is assignable to
//   its base but not the reverse.
// Failure modes: none.
// Side effects: none.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PrimType {
    Int,
    Float,
    String,
    Bool,
    Void,
    Blob,
    File,
}

impl PrimType {
    pub fn name(self) -> &'static str {
        match self {
            PrimType::Int => "int",
            PrimType::Float => "float",
            PrimType::String => "string",
            PrimType::Bool => "boolean",
            PrimType::Void => "void",
            PrimType::Blob => "blob",
            PrimType::File => "file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructField {
    pub name: String,
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructType {
    pub name: String,
    pub fields: Vec<StructField>,
}

impl StructType {
    pub fn field(&self, name: &str) -> Option<&Type> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.ty)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionType {
    pub inputs: Vec<Type>,
    pub outputs: Vec<Type>,
    /// Last input may repeat.
    pub varargs: bool,
    pub type_params: Vec<String>,
}

impl FunctionType {
    /// Formal type for the `i`th actual argument, expanding varargs.
    pub fn input_for(&self, i: usize) -> Option<&Type> {
        match self.inputs.get(i) {
            Some(t) => Some(t),
            None if self.varargs => self.inputs.last(),
            None => None,
        }
    }

    pub fn accepts_arity(&self, n: usize) -> bool {
        if self.varargs {
            n + 1 >= self.inputs.len()
        } else {
            n == self.inputs.len()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Type {
    Prim(PrimType),
    /// Monotonically updated value; only `float` is supported.
    Updateable(PrimType),
    Array { key: Box<Type>, elem: Box<Type> },
    Struct(StructType),
    Ref(Box<Type>),
    Union(Vec<Type>),
    Function(FunctionType),
    SubType { name: String, base: Box<Type> },
    /// Type parameter of a polymorphic builtin, or the element type of an
    /// empty array literal. Matches any type.
    TypeVar(String),
}

impl Type {
    pub fn int() -> Type {
        Type::Prim(PrimType::Int)
    }
    pub fn float() -> Type {
        Type::Prim(PrimType::Float)
    }
    pub fn string() -> Type {
        Type::Prim(PrimType::String)
    }
    pub fn bool() -> Type {
        Type::Prim(PrimType::Bool)
    }
    pub fn void() -> Type {
        Type::Prim(PrimType::Void)
    }
    pub fn file() -> Type {
        Type::Prim(PrimType::File)
    }

    pub fn array(key: Type, elem: Type) -> Type {
        Type::Array {
            key: Box::new(key),
            elem: Box::new(elem),
        }
    }

    pub fn reference(inner: Type) -> Type {
        Type::Ref(Box::new(inner))
    }

    /// Type of an untyped integer literal.
    pub fn int_literal() -> Type {
        Type::Union(vec![Type::int(), Type::float()])
    }

    /// Resolve a built-in type name.
    pub fn from_name(name: &str) -> Option<Type> {
        let prim = match name {
            "int" => PrimType::Int,
            "float" => PrimType::Float,
            "string" => PrimType::String,
            "boolean" | "bool" => PrimType::Bool,
            "void" => PrimType::Void,
            "blob" => PrimType::Blob,
            "file" => PrimType::File,
            "updateable_float" => return Some(Type::Updateable(PrimType::Float)),
            _ => return None,
        };
        Some(Type::Prim(prim))
    }

    /// The type with all sub-type wrappers removed.
    pub fn base(&self) -> &Type {
        match self {
            Type::SubType { base, .. } => base.base(),
            other => other,
        }
    }

    pub fn prim(&self) -> Option<PrimType> {
        match self.base() {
            Type::Prim(p) => Some(*p),
            _ => None,
        }
    }

    pub fn is_prim(&self, p: PrimType) -> bool {
        self.prim() == Some(p)
    }

    pub fn is_int(&self) -> bool {
        self.is_prim(PrimType::Int)
    }
    pub fn is_float(&self) -> bool {
        self.is_prim(PrimType::Float)
    }
    pub fn is_string(&self) -> bool {
        self.is_prim(PrimType::String)
    }
    pub fn is_bool(&self) -> bool {
        self.is_prim(PrimType::Bool)
    }
    pub fn is_void(&self) -> bool {
        self.is_prim(PrimType::Void)
    }
    pub fn is_file(&self) -> bool {
        self.is_prim(PrimType::File)
    }

    pub fn is_array(&self) -> bool {
        matches!(self.base(), Type::Array { .. })
    }

    pub fn is_ref(&self) -> bool {
        matches!(self.base(), Type::Ref(_))
    }

    /// Reference to an array.
    pub fn is_array_ref(&self) -> bool {
        match self.base() {
            Type::Ref(inner) => inner.is_array(),
            _ => false,
        }
    }

    pub fn is_array_or_ref(&self) -> bool {
        self.is_array() || self.is_array_ref()
    }

    pub fn is_struct(&self) -> bool {
        matches!(self.base(), Type::Struct(_))
    }

    pub fn is_union(&self) -> bool {
        matches!(self.base(), Type::Union(_))
    }

    pub fn is_updateable(&self) -> bool {
        matches!(self.base(), Type::Updateable(_))
    }

    pub fn as_struct(&self) -> Option<&StructType> {
        match self.base() {
            Type::Struct(s) => Some(s),
            _ => None,
        }
    }

    /// Element type of an array, referent of a reference.
    pub fn member_type(&self) -> Option<&Type> {
        match self.base() {
            Type::Array { elem, .. } => Some(elem),
            Type::Ref(inner) => Some(inner),
            _ => None,
        }
    }

    /// Key type of an array or array reference.
    pub fn array_key(&self) -> Option<&Type> {
        match self.base() {
            Type::Array { key, .. } => Some(key),
            Type::Ref(inner) => inner.array_key(),
            _ => None,
        }
    }

    /// Element type of an array or array reference.
    pub fn array_elem(&self) -> Option<&Type> {
        match self.base() {
            Type::Array { elem, .. } => Some(elem),
            Type::Ref(inner) => inner.array_elem(),
            _ => None,
        }
    }

    /// Whether code can block until a variable of this type is closed.
    pub fn can_wait_for_finalize(&self) -> bool {
        !matches!(
            self.base(),
            Type::Updateable(_) | Type::Union(_) | Type::Function(_) | Type::TypeVar(_)
        )
    }

    /// Only files may carry a mapping.
    pub fn is_mappable(&self) -> bool {
        self.is_file()
    }

    /// Primitive types that can be written as an app command-line argument.
    pub fn is_app_arg(&self) -> bool {
        matches!(
            self.prim(),
            Some(PrimType::String | PrimType::Int | PrimType::Float | PrimType::Bool | PrimType::File)
        )
    }

    /// Union alternatives, or the type itself.
    pub fn alternatives(&self) -> Vec<&Type> {
        match self.base() {
            Type::Union(alts) => alts.iter().collect(),
            _ => vec![self],
        }
    }

    /// Whether the type contains union or type-variable components.
    pub fn is_polymorphic(&self) -> bool {
        match self.base() {
            Type::Union(_) | Type::TypeVar(_) => true,
            Type::Array { key, elem } => key.is_polymorphic() || elem.is_polymorphic(),
            Type::Ref(inner) => inner.is_polymorphic(),
            _ => false,
        }
    }

    /// Whether a value of type `self` may be stored in a variable of type `target`.
    pub fn assignable_to(&self, target: &Type) -> bool {
        if self == target {
            return true;
        }
        match (self, target) {
            (Type::TypeVar(_), _) | (_, Type::TypeVar(_)) => true,
            (Type::Union(alts), _) => alts.iter().any(|a| a.assignable_to(target)),
            (_, Type::Union(alts)) => alts.iter().any(|a| self.assignable_to(a)),
            (Type::SubType { base, .. }, _) => base.assignable_to(target),
            (
                Type::Array { key: k1, elem: e1 },
                Type::Array { key: k2, elem: e2 },
            ) => k1.assignable_to(k2) && e1.assignable_to(e2),
            (Type::Ref(a), Type::Ref(b)) => a.assignable_to(b),
            (Type::Struct(a), Type::Struct(b)) => a.name == b.name,
            _ => false,
        }
    }

    /// Narrow `self` to a concrete type assignable to `target`: the first
    /// matching union alternative, or `self` if it is already concrete.
    pub fn concretize_for(&self, target: &Type) -> Option<Type> {
        match self {
            Type::Union(alts) => alts
                .iter()
                .find(|a| a.assignable_to(target))
                .cloned(),
            Type::TypeVar(_) => Some(target.clone()),
            Type::Array { key, elem } if elem.is_polymorphic() => {
                let target_elem = target.array_elem()?;
                Some(Type::array(
                    (**key).clone(),
                    elem.concretize_for(target_elem)?,
                ))
            }
            _ if self.assignable_to(target) => Some(self.clone()),
            _ => None,
        }
    }

    /// Default concrete type: first union alternative.
    pub fn concrete(&self) -> Type {
        match self {
            Type::Union(alts) if !alts.is_empty() => alts[0].clone(),
            other => other.clone(),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Prim(p) => write!(f, "{}", p.name()),
            Type::Updateable(p) => write!(f, "updateable_{}", p.name()),
            Type::Array { key, elem } => {
                if key.is_int() {
                    write!(f, "{}[]", elem)
                } else {
                    write!(f, "{}[{}]", elem, key)
                }
            }
            Type::Struct(s) => write!(f, "{}", s.name),
            Type::Ref(inner) => write!(f, "*({})", inner),
            Type::Union(alts) => {
                for (i, a) in alts.iter().enumerate() {
                    if i > 0 {
                        write!(f, "|")?;
                    }
                    write!(f, "{}", a)?;
                }
                Ok(())
            }
            Type::Function(ft) => {
                write!(f, "(")?;
                write_list(f, &ft.outputs)?;
                write!(f, ") <- (")?;
                write_list(f, &ft.inputs)?;
                if ft.varargs {
                    write!(f, "...")?;
                }
                write!(f, ")")
            }
            Type::SubType { name, .. } => write!(f, "{}", name),
            Type::TypeVar(name) => write!(f, "{}", name),
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, types: &[Type]) -> fmt::Result {
    for (i, t) in types.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", t)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(name: &str, base: Type) -> Type {
        Type::SubType {
            name: name.to_string(),
            base: Box::new(base),
        }
    }

    #[test]
    fn int_literal_fits_int_and_float() {
        let lit = Type::int_literal();
        assert!(lit.assignable_to(&Type::int()));
        assert!(lit.assignable_to(&Type::float()));
        assert!(!lit.assignable_to(&Type::string()));
        assert_eq!(lit.concretize_for(&Type::float()), Some(Type::float()));
    }

    #[test]
    fn subtype_assigns_to_base_only() {
        let id = sub("id", Type::string());
        assert!(id.assignable_to(&Type::string()));
        assert!(!Type::string().assignable_to(&id));
        assert!(id.is_string());
    }

    #[test]
    fn array_queries_look_through_refs() {
        let arr = Type::array(Type::string(), Type::int());
        let r = Type::reference(arr.clone());
        assert!(r.is_array_ref());
        assert!(!arr.is_array_ref());
        assert_eq!(r.array_key(), Some(&Type::string()));
        assert_eq!(r.array_elem(), Some(&Type::int()));
        assert_eq!(r.member_type(), Some(&arr));
    }

    #[test]
    fn empty_array_literal_concretizes() {
        let empty = Type::array(Type::int(), Type::TypeVar("?".to_string()));
        let target = Type::array(Type::int(), Type::float());
        assert_eq!(empty.concretize_for(&target), Some(target.clone()));
    }

    #[test]
    fn wait_support() {
        assert!(Type::int().can_wait_for_finalize());
        assert!(Type::array(Type::int(), Type::int()).can_wait_for_finalize());
        assert!(!Type::Updateable(PrimType::Float).can_wait_for_finalize());
    }

    #[test]
    fn display_forms() {
        assert_eq!(Type::array(Type::int(), Type::file()).to_string(), "file[]");
        assert_eq!(
            Type::array(Type::string(), Type::int()).to_string(),
            "int[string]"
        );
        assert_eq!(Type::reference(Type::int()).to_string(), "*(int)");
        assert_eq!(Type::int_literal().to_string(), "int|float");
        assert_eq!(Type::bool().to_string(), "boolean");
    }
}
