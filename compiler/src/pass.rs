// pass.rs — Frontend pass descriptors
//
// The frontend walks the whole module graph twice. The definitions pass
// registers every signature and emits only definition instructions; the
// compile pass lowers function and app bodies. `Session::walk` runs the
// passes `required_passes` lists, in order.

use std::fmt;

// ── Pass identifiers ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrontendPass {
    Definitions,
    Compile,
}

impl FrontendPass {
    pub const ALL: &'static [FrontendPass] = &[FrontendPass::Definitions, FrontendPass::Compile];
}

impl fmt::Display for FrontendPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", descriptor(*self).name)
    }
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a frontend pass.
pub struct PassDescriptor {
    pub name: &'static str,
    /// Passes that must have completed over the whole program first.
    pub inputs: &'static [FrontendPass],
}

pub fn descriptor(pass: FrontendPass) -> PassDescriptor {
    match pass {
        FrontendPass::Definitions => PassDescriptor {
            name: "definitions",
            inputs: &[],
        },
        FrontendPass::Compile => PassDescriptor {
            name: "compile",
            inputs: &[FrontendPass::Definitions],
        },
    }
}

/// Passes required to reach `target`, in execution order.
pub fn required_passes(target: FrontendPass) -> Vec<FrontendPass> {
    let mut out = Vec::new();
    for dep in descriptor(target).inputs {
        for p in required_passes(*dep) {
            if !out.contains(&p) {
                out.push(p);
            }
        }
    }
    out.push(target);
    out
}
