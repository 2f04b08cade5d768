// id.rs — Deterministic names for compiler temporaries and constructs
//
// One `NameCounters` per function being compiled. Temporaries share a
// single monotonically increasing counter; construct names (waits, loops)
// use one counter per construct kind. Names depend only on traversal
// order, so compiling the same source twice yields identical IR.

use std::collections::HashMap;

/// Naming state for one function body.
#[derive(Debug, Default)]
pub struct NameCounters {
    function: String,
    next_temp: u32,
    kinds: HashMap<&'static str, u32>,
}

impl NameCounters {
    pub fn new(function: impl Into<String>) -> Self {
        NameCounters {
            function: function.into(),
            next_temp: 0,
            kinds: HashMap::new(),
        }
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    /// Next temporary with the given prefix, e.g. `__t3`.
    pub fn temp(&mut self, prefix: &str) -> String {
        let n = self.next_temp;
        self.next_temp += 1;
        format!("__{}{}", prefix, n)
    }

    /// Temporary derived from a user variable, e.g. `__v4_x`.
    pub fn temp_for(&mut self, prefix: &str, base: &str) -> String {
        let n = self.next_temp;
        self.next_temp += 1;
        format!("__{}{}_{}", prefix, n, base)
    }

    /// Return and advance the counter for `kind`.
    pub fn counter_val(&mut self, kind: &'static str) -> u32 {
        let slot = self.kinds.entry(kind).or_insert(0);
        let n = *slot;
        *slot += 1;
        n
    }

    /// Unique construct name, e.g. `main-if0`.
    pub fn construct_name(&mut self, kind: &'static str) -> String {
        let n = self.counter_val(kind);
        format!("{}-{}{}", self.function, kind, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temps_share_one_counter() {
        let mut c = NameCounters::new("f");
        assert_eq!(c.temp("t"), "__t0");
        assert_eq!(c.temp_for("v", "x"), "__v1_x");
        assert_eq!(c.temp("t"), "__t2");
    }

    #[test]
    fn construct_names_count_per_kind() {
        let mut c = NameCounters::new("main");
        assert_eq!(c.construct_name("if"), "main-if0");
        assert_eq!(c.construct_name("if"), "main-if1");
        assert_eq!(c.construct_name("chain"), "main-chain0");
        assert_eq!(c.counter_val("foreach-range"), 0);
        assert_eq!(c.counter_val("foreach-range"), 1);
    }
}
