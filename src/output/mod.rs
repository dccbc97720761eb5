use crate::dialog::{Dialog, Message};
use crate::generator::Usage;
use crate::session::ChatRun;
use chrono::Utc;
use serde::Serialize;
use std::fmt::Write;

const SEPARATOR: &str = "==================================";

/// Plain transcript: every input message, the generated reply, then the runtime.
pub fn render_text(run: &ChatRun) -> String {
    let mut out = String::new();
    for exchange in &run.exchanges {
        for msg in &exchange.dialog {
            let _ = writeln!(out, "{}: {}\n", msg.role.capitalized(), msg.content);
        }
        let generation = &exchange.prediction.generation;
        let _ = writeln!(
            out,
            "> {}: {}",
            generation.role.capitalized(),
            generation.content
        );
        let _ = writeln!(out, "\n{SEPARATOR}\n");
    }
    let _ = writeln!(out, "runtime: {:.5} seconds", run.elapsed.as_secs_f64());
    out
}

#[derive(Serialize)]
struct JsonReport<'a> {
    generated_at: String,
    runtime_secs: f64,
    results: Vec<JsonResult<'a>>,
}

#[derive(Serialize)]
struct JsonResult<'a> {
    dialog: &'a Dialog,
    generation: &'a Message,
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<Usage>,
}

pub fn render_json(run: &ChatRun) -> serde_json::Result<String> {
    let report = JsonReport {
        generated_at: Utc::now().to_rfc3339(),
        runtime_secs: run.elapsed.as_secs_f64(),
        results: run
            .exchanges
            .iter()
            .map(|e| JsonResult {
                dialog: &e.dialog,
                generation: &e.prediction.generation,
                usage: e.prediction.usage,
            })
            .collect(),
    };
    serde_json::to_string_pretty(&report)
}
