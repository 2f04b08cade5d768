// deadlock.rs — Static checks for writes that can never happen
//
// A block that only runs after `x` is closed can never write `x`. These
// checks reject such programs using the usage summaries of the gated
// blocks, and compute which containers a gated block may still write.
//
// Preconditions: summaries were computed from the gated blocks.
// Postconditions: conservative; may reject programs that would not deadlock.
// Failure modes: `CompileError::User` with E0403/E0404.
// Side effects: none.

use crate::ast::Span;
use crate::diag::{codes, Diagnostic, WalkResult};
use crate::scope::{Alloc, DefKind, Var};
use crate::types::Type;
use crate::usage::{UsageSummary, VarUsage};

/// Reject a conditional whose condition variable is assigned in a branch.
pub fn check_conditional_deadlock(
    cond: &Var,
    branches: &[UsageSummary],
    span: Span,
) -> WalkResult<()> {
    if branches.iter().any(|b| b.possibly_assigned(&cond.name)) {
        return Err(Diagnostic::error(
            codes::E0403,
            span,
            format!(
                "Deadlock on {}, var is assigned inside conditional branch for which it is the condition",
                cond.name
            ),
        )
        .into());
    }
    Ok(())
}

/// Reject a wait whose body may assign any waited variable. All offending
/// names are listed.
pub fn check_no_self_write_under_wait(
    waited: &[Var],
    branches: &[UsageSummary],
    span: Span,
) -> WalkResult<()> {
    let mut offending: Vec<&str> = Vec::new();
    for v in waited {
        if branches.iter().any(|b| b.possibly_assigned(&v.name))
            && !offending.contains(&v.name.as_str())
        {
            offending.push(&v.name);
        }
    }
    if offending.is_empty() {
        return Ok(());
    }
    Err(Diagnostic::error(
        codes::E0404,
        span,
        format!(
            "Deadlock in wait statement. The following variables are written inside the body of the wait: [{}]",
            offending.join(", ")
        ),
    )
    .into())
}

/// Arrays (including arrays nested in struct fields) among `visible` that
/// any branch may write. Struct fields are reported as `s.f.g` aliases.
pub fn summarise_branch_variable_usage<'a>(
    visible: impl IntoIterator<Item = &'a Var>,
    branches: &[UsageSummary],
) -> Vec<Var> {
    let mut written: Vec<Var> = Vec::new();
    for var in visible {
        for branch in branches {
            let Some(usage) = branch.lookup(&var.name) else {
                continue;
            };
            if var.ty.is_array_or_ref() && usage.possibly_assigned() {
                push_unique(&mut written, var.clone());
            } else if var.ty.is_struct() {
                arrays_in_struct(&var.name, &var.ty, usage, &mut written);
            }
        }
    }
    written
}

fn arrays_in_struct(path: &str, ty: &Type, usage: &VarUsage, out: &mut Vec<Var>) {
    let Some(st) = ty.as_struct() else {
        return;
    };
    // Whole-struct assignment writes every field.
    let whole = VarUsage {
        assigned: true,
        fields: Default::default(),
    };
    for field in &st.fields {
        let field_path = format!("{}.{}", path, field.name);
        let field_usage = if usage.assigned {
            &whole
        } else {
            match usage.field(&field.name) {
                Some(u) => u,
                None => continue,
            }
        };
        if field.ty.is_array_or_ref() && field_usage.possibly_assigned() {
            push_unique(
                out,
                Var::new(field_path, field.ty.clone(), Alloc::Alias, DefKind::LocalCompiler),
            );
        } else if field.ty.is_struct() {
            arrays_in_struct(&field_path, &field.ty, field_usage, out);
        }
    }
}

fn push_unique(out: &mut Vec<Var>, var: Var) {
    if !out.iter().any(|v| v.name == var.name) {
        out.push(var);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Block, TopLevelKind};
    use crate::types::{StructField, StructType};
    use crate::usage::summarize_block;

    fn span() -> Span {
        (0..0).into()
    }

    fn body(src: &str) -> Block {
        let program = crate::parser::parse(&format!("main {{ {} }}", src))
            .program
            .unwrap();
        let TopLevelKind::Function(f) = &program.items[0].kind else {
            panic!()
        };
        f.body.clone()
    }

    fn var(name: &str, ty: Type) -> Var {
        Var::new(name, ty, Alloc::Stack, DefKind::LocalUser)
    }

    #[test]
    fn condition_written_in_branch_is_rejected() {
        let c = var("c", Type::bool());
        let branches = vec![summarize_block(&body("x = 1;")), summarize_block(&body("c = true;"))];
        let err = check_conditional_deadlock(&c, &branches, span()).unwrap_err();
        assert!(err.to_string().contains("Deadlock on c"));
        assert!(check_conditional_deadlock(&c, &branches[..1], span()).is_ok());
    }

    #[test]
    fn wait_lists_every_offender() {
        let waited = vec![var("a", Type::int()), var("b", Type::int()), var("z", Type::int())];
        let branches = vec![summarize_block(&body("a = 1; b = 2;"))];
        let err = check_no_self_write_under_wait(&waited, &branches, span()).unwrap_err();
        assert!(err.to_string().contains("[a, b]"), "{}", err);
    }

    #[test]
    fn written_arrays_and_struct_array_fields() {
        let st = Type::Struct(StructType {
            name: "rec".into(),
            fields: vec![
                StructField {
                    name: "xs".into(),
                    ty: Type::array(Type::int(), Type::int()),
                },
                StructField {
                    name: "n".into(),
                    ty: Type::int(),
                },
            ],
        });
        let visible = vec![
            var("A", Type::array(Type::int(), Type::int())),
            var("B", Type::array(Type::int(), Type::int())),
            var("s", st),
            var("x", Type::int()),
        ];
        let branches = vec![summarize_block(&body("A[1] = 2; s.xs[0] = 1; s.n = 3; x = 4;"))];
        let written = summarise_branch_variable_usage(&visible, &branches);
        let names: Vec<&str> = written.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["A", "s.xs"]);
    }
}
