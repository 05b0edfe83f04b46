//! Expands parameterized object manifests.
//!
//! Manifests are handlebars documents rendered against a context assembled
//! from process environment variables, job variables, object input vars and
//! the per-replica loop variables. A small helper library covers the hashing,
//! arithmetic, network-address and combinatorial functions the manifests
//! under test rely on.
use handlebars::{Handlebars, RenderErrorReason};
use serde_json::Value;

/// What to do when a template references a key absent from the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingKeyPolicy {
    /// Fail the render.
    #[default]
    Error,
    /// Substitute an empty value.
    Zero,
}

/// Errors produced while expanding a template.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// The template document failed to parse.
    #[error("template parsing error: {0}")]
    Parse(#[from] handlebars::TemplateError),
    /// A referenced key was absent under the strict missing-key policy.
    #[error("missing template variable: {0}")]
    MissingKey(String),
    /// Substitution failed.
    #[error("template rendering error: {0}")]
    Render(handlebars::RenderError),
}

impl From<handlebars::RenderError> for RenderError {
    fn from(err: handlebars::RenderError) -> Self {
        match err.reason() {
            RenderErrorReason::MissingVariable(path) => {
                RenderError::MissingKey(path.clone().unwrap_or_default())
            }
            _ => RenderError::Render(err),
        }
    }
}

mod helpers {
    use super::{binomial, unrank_combination};
    use handlebars::handlebars_helper;
    use rand::{distributions::Alphanumeric, Rng};
    use sha2::{Digest, Sha256};

    handlebars_helper!(add: |a: i64, b: i64| a + b);
    handlebars_helper!(multiply: |a: i64, b: i64| a * b);
    handlebars_helper!(sha256sum: |input: str| hex::encode(Sha256::digest(input.as_bytes())));
    handlebars_helper!(rand_alpha_num: |n: usize| {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(n)
            .map(char::from)
            .collect::<String>()
    });
    handlebars_helper!(get_subnet24: |idx: u64| {
        format!(
            "{}.{}.{}.0/24",
            ((idx >> 16) + 1) & 0xff,
            (idx >> 8) & 0xff,
            idx & 0xff
        )
    });
    handlebars_helper!(binomial_helper: |n: u64, k: u64| binomial(n, k));
    handlebars_helper!(index_to_combination: |idx: u64, n: u64, k: u64| {
        unrank_combination(idx, n, k)
    });
    handlebars_helper!(get_ip_address: |addresses: str, iteration: u64, per_iteration: u64| {
        let pool: Vec<&str> = addresses.split_whitespace().collect();
        let start = (iteration * per_iteration) as usize;
        pool.iter()
            .skip(start)
            .take(per_iteration as usize)
            .copied()
            .collect::<Vec<_>>()
            .join(" ")
    });
}

/// Binomial coefficient C(n, k), saturating at `u64::MAX`.
fn binomial(n: u64, k: u64) -> u64 {
    if k > n {
        return 0;
    }
    let k = k.min(n - k);
    let mut acc: u64 = 1;
    for i in 0..k {
        acc = acc.saturating_mul(n - i) / (i + 1);
    }
    acc
}

/// Lexicographic unranking: the `idx`-th k-combination of {0..n-1}.
fn unrank_combination(mut idx: u64, n: u64, k: u64) -> Vec<u64> {
    let mut combination = Vec::with_capacity(k as usize);
    let mut next = 0u64;
    for remaining in (1..=k).rev() {
        loop {
            let skipped = binomial(n.saturating_sub(next + 1), remaining - 1);
            if idx < skipped {
                break;
            }
            idx -= skipped;
            next += 1;
        }
        combination.push(next);
        next += 1;
    }
    combination
}

/// Template renderer with a fixed missing-key policy.
pub struct Renderer {
    engine: Handlebars<'static>,
}

impl Renderer {
    /// Create a renderer, registering the manifest helper library.
    pub fn new(policy: MissingKeyPolicy) -> Self {
        let mut engine = Handlebars::new();
        engine.set_strict_mode(policy == MissingKeyPolicy::Error);
        // Manifests are YAML, not HTML.
        engine.register_escape_fn(handlebars::no_escape);
        engine.register_helper("add", Box::new(helpers::add));
        engine.register_helper("multiply", Box::new(helpers::multiply));
        engine.register_helper("sha256sum", Box::new(helpers::sha256sum));
        engine.register_helper("randAlphaNum", Box::new(helpers::rand_alpha_num));
        engine.register_helper("getSubnet24", Box::new(helpers::get_subnet24));
        engine.register_helper("binomial", Box::new(helpers::binomial_helper));
        engine.register_helper("indexToCombination", Box::new(helpers::index_to_combination));
        engine.register_helper("getIPAddress", Box::new(helpers::get_ip_address));
        Self { engine }
    }

    /// Expand `template` against `data`.
    pub fn render(&self, template: &str, data: &Value) -> Result<String, RenderError> {
        Ok(self.engine.render_template(template, data)?)
    }

    /// Check that `template` parses, without rendering it.
    pub fn validate(&self, template: &str) -> Result<(), RenderError> {
        handlebars::Template::compile(template)?;
        Ok(())
    }
}

/// The process environment as a rendering context layer.
pub fn env_map() -> serde_json::Map<String, Value> {
    std::env::vars()
        .map(|(k, v)| (k, Value::String(v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use expect_test::expect;
    use serde_json::json;

    use super::*;

    #[test]
    fn renders_a_full_manifest() {
        let renderer = Renderer::new(MissingKeyPolicy::Error);
        let template = "\
apiVersion: v1
kind: Pod
metadata:
  name: pod-{{Iteration}}-{{Replica}}
  labels:
    app: backend-{{Iteration}}
spec:
  containers:
    - name: app
      image: {{image}}
";
        let out = renderer
            .render(
                template,
                &json!({"Iteration": 2, "Replica": 1, "image": "registry.k8s.io/pause:3.9"}),
            )
            .unwrap();
        expect![[r#"
            apiVersion: v1
            kind: Pod
            metadata:
              name: pod-2-1
              labels:
                app: backend-2
            spec:
              containers:
                - name: app
                  image: registry.k8s.io/pause:3.9
        "#]]
        .assert_eq(&out);
    }

    #[test]
    fn renders_loop_variables() {
        let renderer = Renderer::new(MissingKeyPolicy::Error);
        let out = renderer
            .render(
                "name: {{JobName}}-{{Iteration}}-{{Replica}}",
                &json!({"JobName": "perf", "Iteration": 3, "Replica": 7}),
            )
            .unwrap();
        assert_eq!(out, "name: perf-3-7");
    }

    #[test]
    fn strict_policy_rejects_missing_keys() {
        let renderer = Renderer::new(MissingKeyPolicy::Error);
        let err = renderer
            .render("value: {{UNSET}}", &json!({}))
            .unwrap_err();
        assert!(matches!(err, RenderError::MissingKey(_)), "got {err:?}");
    }

    #[test]
    fn zero_policy_substitutes_empty() {
        let renderer = Renderer::new(MissingKeyPolicy::Zero);
        let out = renderer.render("value: '{{UNSET}}'", &json!({})).unwrap();
        assert_eq!(out, "value: ''");
    }

    #[test]
    fn rendering_is_deterministic() {
        let renderer = Renderer::new(MissingKeyPolicy::Error);
        let data = json!({"Iteration": 9, "Replica": 2, "cpu": "250m"});
        let template = "pod-{{Iteration}}-{{Replica}}: {{cpu}} {{sha256sum \"\"}}";
        let first = renderer.render(template, &data).unwrap();
        let second = renderer.render(template, &data).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn sha256sum_of_empty_input() {
        let renderer = Renderer::new(MissingKeyPolicy::Error);
        let out = renderer.render("{{sha256sum \"\"}}", &json!({})).unwrap();
        assert_eq!(
            out,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn subnet_for_iteration_index() {
        let renderer = Renderer::new(MissingKeyPolicy::Error);
        let out = renderer
            .render("{{getSubnet24 0}} {{getSubnet24 300}}", &json!({}))
            .unwrap();
        assert_eq!(out, "1.0.0.0/24 1.1.44.0/24");
    }

    #[test]
    fn arithmetic_helpers() {
        let renderer = Renderer::new(MissingKeyPolicy::Error);
        let out = renderer
            .render("{{add 40 2}} {{multiply 6 7}}", &json!({}))
            .unwrap();
        assert_eq!(out, "42 42");
    }

    #[test]
    fn binomial_and_unranking() {
        assert_eq!(binomial(5, 2), 10);
        assert_eq!(binomial(5, 0), 1);
        assert_eq!(binomial(2, 5), 0);
        assert_eq!(unrank_combination(0, 5, 3), vec![0, 1, 2]);
        assert_eq!(unrank_combination(9, 5, 3), vec![2, 3, 4]);
    }

    #[test]
    fn ip_addresses_per_iteration() {
        let renderer = Renderer::new(MissingKeyPolicy::Error);
        // Iteration 6 with 2 addresses each starts at the 12th address.
        let pool = (0..20)
            .map(|i| format!("10.0.0.{i}"))
            .collect::<Vec<_>>()
            .join(" ");
        let out = renderer
            .render("{{getIPAddress pool 6 2}}", &json!({ "pool": pool }))
            .unwrap();
        assert_eq!(out, "10.0.0.12 10.0.0.13");
    }
}
