//! Environment assembly for command stages.

use crate::context::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One environment variable handed to child processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVar {
    /// The variable name.
    pub key: String,
    /// The value.
    pub value: String,
}

impl EnvVar {
    /// Creates a variable.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A producer appending variables at start time. Producers run in the
/// order they were registered; later values win for colliding keys.
pub type EnvVarProducer = Arc<dyn Fn(&Context, &mut Vec<EnvVar>) + Send + Sync>;

/// The environment a stage runs in: an optional default working
/// directory plus ordered variable producers.
///
/// Variables are materialized per command when the pipeline starts, and
/// they override anything the child would inherit from the current
/// process.
#[derive(Clone, Default)]
pub struct Env {
    dir: Option<PathBuf>,
    vars: Vec<EnvVarProducer>,
}

impl Env {
    /// The default working directory for command stages, if set.
    #[must_use]
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub(crate) fn set_dir(&mut self, dir: PathBuf) {
        self.dir = Some(dir);
    }

    pub(crate) fn push_producer(&mut self, producer: EnvVarProducer) {
        self.vars.push(producer);
    }

    /// Runs the producers in order and resolves key collisions in favor
    /// of the later value.
    #[must_use]
    pub fn materialize(&self, ctx: &Context) -> Vec<EnvVar> {
        let mut vars = Vec::new();
        for producer in &self.vars {
            producer(ctx, &mut vars);
        }

        let mut resolved: Vec<EnvVar> = Vec::with_capacity(vars.len());
        for var in vars {
            if let Some(existing) = resolved.iter_mut().find(|v| v.key == var.key) {
                existing.value = var.value;
            } else {
                resolved.push(var);
            }
        }
        resolved
    }
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env")
            .field("dir", &self.dir)
            .field("producers", &self.vars.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pushing(key: &str, value: &str) -> EnvVarProducer {
        let var = EnvVar::new(key, value);
        Arc::new(move |_ctx, vars| vars.push(var.clone()))
    }

    #[test]
    fn test_empty_env_materializes_to_nothing() {
        assert!(Env::default().materialize(&Context::new()).is_empty());
    }

    #[test]
    fn test_later_producers_override_earlier_keys() {
        let mut env = Env::default();
        env.push_producer(pushing("A", "first"));
        env.push_producer(pushing("B", "kept"));
        env.push_producer(pushing("A", "second"));

        let vars = env.materialize(&Context::new());
        assert_eq!(
            vars,
            vec![EnvVar::new("A", "second"), EnvVar::new("B", "kept")]
        );
    }

    #[test]
    fn test_values_may_contain_equals_signs() {
        let mut env = Env::default();
        env.push_producer(pushing("OPTS", "a=b,c=d"));

        let vars = env.materialize(&Context::new());
        assert_eq!(vars, vec![EnvVar::new("OPTS", "a=b,c=d")]);
    }

    #[test]
    fn test_producers_observe_the_context() {
        let mut env = Env::default();
        env.push_producer(Arc::new(|ctx, vars| {
            if !ctx.is_cancelled() {
                vars.push(EnvVar::new("LIVE", "1"));
            }
        }));

        let ctx = Context::new();
        assert_eq!(env.materialize(&ctx).len(), 1);

        ctx.cancel("done");
        assert!(env.materialize(&ctx).is_empty());
    }
}
