//! Step input resolution
//!
//! A step's configuration may reference run input variables (`{{topic}}`)
//! and outputs of previously succeeded steps (`{{steps.extract.output}}`,
//! with optional field paths into object outputs). Resolution combines the
//! run's validated input and the accumulated outputs into the concrete input
//! persisted on the step execution and handed to the provider.

use std::collections::HashMap;
use std::sync::OnceLock;

use anyhow::{bail, Result};
use regex::Regex;
use serde_json::{json, Map, Value};

use flowkit_core::models::{StepKind, StepSpec};

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_][A-Za-z0-9_.-]*)\s*\}\}").unwrap())
}

/// Resolve a step's concrete input from the run input and prior outputs.
///
/// Unresolvable references are an error: the step is failed without being
/// dispatched, since retrying cannot make a missing output appear.
pub fn resolve_step_input(
    step: &StepSpec,
    run_input: &Map<String, Value>,
    prior_outputs: &HashMap<String, Value>,
) -> Result<Value> {
    let resolved = match &step.kind {
        StepKind::ModelCall {
            model,
            prompt,
            system,
            max_output_tokens,
        } => {
            let mut input = Map::new();
            input.insert("model".into(), json!(model));
            input.insert(
                "prompt".into(),
                json!(render(prompt, run_input, prior_outputs)?),
            );
            if let Some(system) = system {
                input.insert(
                    "system".into(),
                    json!(render(system, run_input, prior_outputs)?),
                );
            }
            if let Some(max) = max_output_tokens {
                input.insert("max_output_tokens".into(), json!(max));
            }
            Value::Object(input)
        }
        StepKind::HttpRequest { url, method, body } => {
            let mut input = Map::new();
            input.insert("url".into(), json!(render(url, run_input, prior_outputs)?));
            input.insert("method".into(), json!(method));
            if let Some(body) = body {
                input.insert("body".into(), json!(render(body, run_input, prior_outputs)?));
            }
            Value::Object(input)
        }
    };
    Ok(resolved)
}

/// Substitute `{{...}}` placeholders in a template string. String values are
/// inserted verbatim; everything else renders as compact JSON.
pub fn render(
    template: &str,
    run_input: &Map<String, Value>,
    prior_outputs: &HashMap<String, Value>,
) -> Result<String> {
    let mut rendered = String::with_capacity(template.len());
    let mut last_end = 0;

    for caps in placeholder_re().captures_iter(template) {
        let whole = caps.get(0).unwrap();
        let path = &caps[1];
        rendered.push_str(&template[last_end..whole.start()]);

        let value = lookup(path, run_input, prior_outputs)?;
        match value {
            Value::String(s) => rendered.push_str(s),
            other => rendered.push_str(&other.to_string()),
        }
        last_end = whole.end();
    }
    rendered.push_str(&template[last_end..]);
    Ok(rendered)
}

fn lookup<'a>(
    path: &str,
    run_input: &'a Map<String, Value>,
    prior_outputs: &'a HashMap<String, Value>,
) -> Result<&'a Value> {
    let mut segments = path.split('.');
    let head = segments.next().unwrap_or_default();

    if head == "steps" {
        let step_id = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("step reference '{{{{{path}}}}}' names no step"))?;
        let output = prior_outputs.get(step_id).ok_or_else(|| {
            anyhow::anyhow!("step reference '{{{{{path}}}}}' has no succeeded step '{step_id}'")
        })?;
        match segments.next() {
            None | Some("output") => descend(output, segments, path),
            Some(other) => bail!("step reference '{{{{{path}}}}}' has unknown member '{other}'"),
        }
    } else {
        let value = run_input
            .get(head)
            .ok_or_else(|| anyhow::anyhow!("unknown input variable '{{{{{path}}}}}'"))?;
        descend(value, segments, path)
    }
}

fn descend<'a, 'b>(
    mut value: &'a Value,
    segments: impl Iterator<Item = &'b str>,
    path: &str,
) -> Result<&'a Value> {
    for segment in segments {
        value = value
            .get(segment)
            .ok_or_else(|| anyhow::anyhow!("path '{{{{{path}}}}}' has no field '{segment}'"))?;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowkit_core::models::RetryPolicy;

    fn run_input(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn renders_input_variables() {
        let input = run_input(json!({"topic": "rust", "count": 3}));
        let out = render("Write about {{topic}}, {{count}} items", &input, &HashMap::new()).unwrap();
        assert_eq!(out, "Write about rust, 3 items");
    }

    #[test]
    fn renders_prior_step_output() {
        let input = run_input(json!({}));
        let mut outputs = HashMap::new();
        outputs.insert("extract".to_string(), json!({"text": "hello", "lang": "en"}));
        let out = render(
            "Summarize: {{steps.extract.output.text}}",
            &input,
            &outputs,
        )
        .unwrap();
        assert_eq!(out, "Summarize: hello");

        // Bare output reference renders the whole value as JSON.
        let out = render("{{steps.extract.output}}", &input, &outputs).unwrap();
        assert_eq!(out, r#"{"lang":"en","text":"hello"}"#);
    }

    #[test]
    fn missing_variable_is_an_error() {
        let err = render("{{nope}}", &run_input(json!({})), &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("unknown input variable"));
    }

    #[test]
    fn missing_step_output_is_an_error() {
        let err = render(
            "{{steps.later.output}}",
            &run_input(json!({})),
            &HashMap::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("no succeeded step"));
    }

    #[test]
    fn resolves_model_call_input() {
        let step = StepSpec {
            id: "summarize".into(),
            name: "Summarize".into(),
            kind: StepKind::ModelCall {
                model: "gpt-4o-mini".into(),
                prompt: "Summarize {{document}}".into(),
                system: Some("Be terse.".into()),
                max_output_tokens: Some(256),
            },
            retry: RetryPolicy::default(),
            timeout_seconds: None,
        };
        let input = run_input(json!({"document": "a long text"}));
        let resolved = resolve_step_input(&step, &input, &HashMap::new()).unwrap();
        assert_eq!(resolved["prompt"], json!("Summarize a long text"));
        assert_eq!(resolved["model"], json!("gpt-4o-mini"));
        assert_eq!(resolved["system"], json!("Be terse."));
        assert_eq!(resolved["max_output_tokens"], json!(256));
    }

    #[test]
    fn resolves_http_request_input() {
        let step = StepSpec {
            id: "notify".into(),
            name: "Notify".into(),
            kind: StepKind::HttpRequest {
                url: "https://example.com/{{channel}}".into(),
                method: "POST".into(),
                body: Some(r#"{"summary": "{{steps.summarize.output}}"}"#.into()),
            },
            retry: RetryPolicy::default(),
            timeout_seconds: None,
        };
        let input = run_input(json!({"channel": "alerts"}));
        let mut outputs = HashMap::new();
        outputs.insert("summarize".to_string(), json!("done"));
        let resolved = resolve_step_input(&step, &input, &outputs).unwrap();
        assert_eq!(resolved["url"], json!("https://example.com/alerts"));
        assert_eq!(resolved["body"], json!(r#"{"summary": "done"}"#));
    }
}
