// semantics.rs — Builtin function semantics registry
//
// Records what the registrar learns from builtin declarations and their
// annotations: purity, commutativity, copy/minmax/assert classes, local
// opcode equivalents (both directions), inline templates, dispatch modes,
// special-function implementations, intrinsics and deferred wrappers.
// One registry per compilation session.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

use crate::ir::{Opcode, TaskMode};

// ── Data types ──────────────────────────────────────────────────────────────

/// Functions the frontend treats specially when a builtin claims to
/// implement them via `@implements=NAME`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialFunction {
    Range,
    RangeStep,
    Size,
    Contains,
    InputFile,
    UncachedInputFile,
    Argv,
}

impl SpecialFunction {
    pub const ALL: &'static [SpecialFunction] = &[
        SpecialFunction::Range,
        SpecialFunction::RangeStep,
        SpecialFunction::Size,
        SpecialFunction::Contains,
        SpecialFunction::InputFile,
        SpecialFunction::UncachedInputFile,
        SpecialFunction::Argv,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SpecialFunction::Range => "range",
            SpecialFunction::RangeStep => "range_step",
            SpecialFunction::Size => "size",
            SpecialFunction::Contains => "contains",
            SpecialFunction::InputFile => "input_file",
            SpecialFunction::UncachedInputFile => "uncached_input_file",
            SpecialFunction::Argv => "argv",
        }
    }
}

impl FromStr for SpecialFunction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SpecialFunction::ALL
            .iter()
            .copied()
            .find(|f| f.name() == s)
            .ok_or(())
    }
}

/// Operations the compiler generates inline instead of calling a builtin,
/// selected with `@intrinsic=NAME`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    Filename,
    InputFile,
    OutputFile,
}

impl Intrinsic {
    pub const ALL: &'static [Intrinsic] =
        &[Intrinsic::Filename, Intrinsic::InputFile, Intrinsic::OutputFile];

    pub fn name(self) -> &'static str {
        match self {
            Intrinsic::Filename => "filename",
            Intrinsic::InputFile => "input_file",
            Intrinsic::OutputFile => "output_file",
        }
    }

    pub fn valid_names() -> String {
        Intrinsic::ALL
            .iter()
            .map(|i| i.name())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl FromStr for Intrinsic {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Intrinsic::ALL
            .iter()
            .copied()
            .find(|i| i.name() == s)
            .ok_or(())
    }
}

/// One piece of an inline template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TemplateElem {
    Text(String),
    Variable(String),
}

impl fmt::Display for TemplateElem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateElem::Text(t) => write!(f, "{:?}", t),
            TemplateElem::Variable(v) => write!(f, "{}", v),
        }
    }
}

/// Inline code template with `<<name>>` placeholders bound to the
/// builtin's positional input and output names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpTemplate {
    pub elems: Vec<TemplateElem>,
    pub in_names: Vec<String>,
    pub out_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unterminated placeholder starting at offset {0}")]
    Unterminated(usize),
    #[error("template variable {0} is not an argument of the function")]
    UnknownVariable(String),
}

impl OpTemplate {
    /// Split `text` into literal runs and `<<name>>` variables. Every
    /// variable must be one of `in_names` or `out_names`.
    pub fn parse(
        text: &str,
        in_names: Vec<String>,
        out_names: Vec<String>,
    ) -> Result<OpTemplate, TemplateError> {
        let mut elems = Vec::new();
        let mut rest = text;
        let mut offset = 0;
        while let Some(open) = rest.find("<<") {
            if open > 0 {
                elems.push(TemplateElem::Text(rest[..open].to_string()));
            }
            let after = &rest[open + 2..];
            let close = after
                .find(">>")
                .ok_or(TemplateError::Unterminated(offset + open))?;
            let name = after[..close].trim().to_string();
            if !in_names.contains(&name) && !out_names.contains(&name) {
                return Err(TemplateError::UnknownVariable(name));
            }
            elems.push(TemplateElem::Variable(name));
            let consumed = open + 2 + close + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            elems.push(TemplateElem::Text(rest.to_string()));
        }
        Ok(OpTemplate {
            elems,
            in_names,
            out_names,
        })
    }
}

impl fmt::Display for OpTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let elems: Vec<String> = self.elems.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", elems.join(" "))
    }
}

/// Deferred wrapper for a template-only builtin, generated on first call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WrapperSpec {
    pub task_mode: TaskMode,
    pub parallel: bool,
    pub targetable: bool,
}

// ── Registry ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct Semantics {
    pure: HashSet<String>,
    commutative: HashSet<String>,
    copy: HashSet<String>,
    minmax: HashSet<String>,
    assert_variants: HashSet<String>,
    local_equivalents: HashMap<String, Opcode>,
    op_impls: HashMap<Opcode, Vec<String>>,
    inline_templates: HashMap<String, OpTemplate>,
    task_modes: HashMap<String, TaskMode>,
    special_impls: HashMap<SpecialFunction, Vec<String>>,
    intrinsics: HashMap<String, Intrinsic>,
    wrappers: HashMap<String, WrapperSpec>,
}

impl Semantics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pure(&mut self, name: &str) {
        self.pure.insert(name.to_string());
    }

    pub fn is_pure(&self, name: &str) -> bool {
        self.pure.contains(name)
    }

    pub fn add_commutative(&mut self, name: &str) {
        self.commutative.insert(name.to_string());
    }

    pub fn is_commutative(&self, name: &str) -> bool {
        self.commutative.contains(name)
    }

    pub fn add_copy(&mut self, name: &str) {
        self.copy.insert(name.to_string());
    }

    pub fn is_copy(&self, name: &str) -> bool {
        self.copy.contains(name)
    }

    pub fn add_minmax(&mut self, name: &str) {
        self.minmax.insert(name.to_string());
    }

    pub fn is_minmax(&self, name: &str) -> bool {
        self.minmax.contains(name)
    }

    /// Assert variants can be dropped wholesale when assertions are disabled.
    pub fn add_assert_variant(&mut self, name: &str) {
        self.assert_variants.insert(name.to_string());
    }

    pub fn is_assert_variant(&self, name: &str) -> bool {
        self.assert_variants.contains(name)
    }

    /// Annotated semantic traits of `name`, for definition listings.
    pub fn traits(&self, name: &str) -> Vec<&'static str> {
        [
            ("pure", self.is_pure(name)),
            ("commutative", self.is_commutative(name)),
            ("copy", self.is_copy(name)),
            ("minmax", self.is_minmax(name)),
            ("assertion", self.is_assert_variant(name)),
        ]
        .into_iter()
        .filter_map(|(trait_name, set)| set.then_some(trait_name))
        .collect()
    }

    /// Record that `name` computes the same thing as `op`. Also indexes the
    /// reverse direction for `find_op_impl`.
    pub fn add_local_equivalent(&mut self, name: &str, op: Opcode) {
        self.local_equivalents.insert(name.to_string(), op);
        self.op_impls.entry(op).or_default().push(name.to_string());
    }

    pub fn local_equivalent(&self, name: &str) -> Option<Opcode> {
        self.local_equivalents.get(name).copied()
    }

    /// Builtins registered as implementing `op`, in registration order.
    pub fn find_op_impl(&self, op: Opcode) -> &[String] {
        self.op_impls.get(&op).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn add_inline_template(&mut self, name: &str, template: OpTemplate) {
        self.inline_templates.insert(name.to_string(), template);
    }

    pub fn inline_template(&self, name: &str) -> Option<&OpTemplate> {
        self.inline_templates.get(name)
    }

    pub fn has_local_version(&self, name: &str) -> bool {
        self.inline_templates.contains_key(name)
    }

    pub fn set_task_mode(&mut self, name: &str, mode: TaskMode) {
        self.task_modes.insert(name.to_string(), mode);
    }

    /// Dispatch mode for a builtin; `CONTROL` unless annotated.
    pub fn task_mode(&self, name: &str) -> TaskMode {
        self.task_modes
            .get(name)
            .copied()
            .unwrap_or(TaskMode::Control)
    }

    pub fn add_special_impl(&mut self, special: SpecialFunction, name: &str) {
        self.special_impls
            .entry(special)
            .or_default()
            .push(name.to_string());
    }

    pub fn special_impls(&self, special: SpecialFunction) -> &[String] {
        self.special_impls
            .get(&special)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn add_intrinsic(&mut self, name: &str, intrinsic: Intrinsic) {
        self.intrinsics.insert(name.to_string(), intrinsic);
    }

    pub fn intrinsic(&self, name: &str) -> Option<Intrinsic> {
        self.intrinsics.get(name).copied()
    }

    pub fn save_wrapper(&mut self, name: &str, spec: WrapperSpec) {
        self.wrappers.insert(name.to_string(), spec);
    }

    pub fn wrapper(&self, name: &str) -> Option<&WrapperSpec> {
        self.wrappers.get(name)
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn template_splits_text_and_variables() {
        let t = OpTemplate::parse(
            "set <<o>> [ expr <<a>> + <<b>> ]",
            names(&["a", "b"]),
            names(&["o"]),
        )
        .unwrap();
        assert_eq!(
            t.elems,
            vec![
                TemplateElem::Text("set ".into()),
                TemplateElem::Variable("o".into()),
                TemplateElem::Text(" [ expr ".into()),
                TemplateElem::Variable("a".into()),
                TemplateElem::Text(" + ".into()),
                TemplateElem::Variable("b".into()),
                TemplateElem::Text(" ]".into()),
            ]
        );
    }

    #[test]
    fn template_rejects_unknown_variable() {
        let err = OpTemplate::parse("<<z>>", names(&["a"]), vec![]).unwrap_err();
        assert_eq!(err, TemplateError::UnknownVariable("z".into()));
    }

    #[test]
    fn template_rejects_unterminated_placeholder() {
        let err = OpTemplate::parse("x <<a", names(&["a"]), vec![]).unwrap_err();
        assert_eq!(err, TemplateError::Unterminated(2));
    }

    #[test]
    fn local_equivalents_index_both_directions() {
        let mut s = Semantics::new();
        s.add_local_equivalent("plus_integer", Opcode::PlusInt);
        s.add_local_equivalent("add_ints", Opcode::PlusInt);
        assert_eq!(s.local_equivalent("plus_integer"), Some(Opcode::PlusInt));
        assert_eq!(
            s.find_op_impl(Opcode::PlusInt),
            &["plus_integer".to_string(), "add_ints".to_string()]
        );
        assert!(s.find_op_impl(Opcode::Sqrt).is_empty());
    }

    #[test]
    fn property_sets() {
        let mut s = Semantics::new();
        s.add_pure("f");
        s.add_commutative("f");
        s.add_assert_variant("assertEqual");
        assert!(s.is_pure("f") && s.is_commutative("f"));
        assert!(!s.is_copy("f") && !s.is_minmax("f"));
        assert!(s.is_assert_variant("assertEqual"));
        assert_eq!(s.traits("f"), vec!["pure", "commutative"]);
        assert_eq!(s.traits("assertEqual"), vec!["assertion"]);
        assert!(s.traits("g").is_empty());
    }

    #[test]
    fn task_mode_defaults_to_control() {
        let mut s = Semantics::new();
        assert_eq!(s.task_mode("f"), TaskMode::Control);
        s.set_task_mode("f", TaskMode::Worker);
        assert_eq!(s.task_mode("f"), TaskMode::Worker);
    }

    #[test]
    fn intrinsic_and_special_names() {
        assert_eq!("filename".parse::<Intrinsic>(), Ok(Intrinsic::Filename));
        assert!("bogus".parse::<Intrinsic>().is_err());
        assert_eq!("size".parse::<SpecialFunction>(), Ok(SpecialFunction::Size));
    }
}
