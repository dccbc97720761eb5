// Example driver: one timed chat-completion call over a fixed batch of dialogs.

use crate::dialog::Dialog;
use crate::error::{Error, Result};
use crate::generator::{ChatPrediction, CompletionOptions, Generator};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone)]
pub struct Exchange {
    pub dialog: Dialog,
    pub prediction: ChatPrediction,
}

#[derive(Debug, Clone)]
pub struct ChatRun {
    pub exchanges: Vec<Exchange>,
    /// Wall-clock time spent inside the completion call only.
    pub elapsed: Duration,
}

/// Submit `dialogs` to `generator` and pair every dialog with its reply.
///
/// Generator errors are returned as-is. A generator that answers with a
/// different number of predictions than dialogs is treated as a parse error.
pub async fn run(
    generator: &dyn Generator,
    dialogs: Vec<Dialog>,
    options: &CompletionOptions,
) -> Result<ChatRun> {
    info!(
        dialogs = dialogs.len(),
        temperature = options.temperature,
        top_p = options.top_p,
        max_gen_len = ?options.max_gen_len,
        load_start_state = options.start_state.load,
        save_start_state = options.start_state.save,
        "starting chat completion"
    );

    let start = Instant::now();
    let predictions = generator.chat_completion(&dialogs, options).await?;
    let elapsed = start.elapsed();

    if predictions.len() != dialogs.len() {
        return Err(Error::parse(format!(
            "expected {} predictions, got {}",
            dialogs.len(),
            predictions.len()
        )));
    }

    info!(elapsed_secs = elapsed.as_secs_f64(), "chat completion finished");

    let exchanges = dialogs
        .into_iter()
        .zip(predictions)
        .map(|(dialog, prediction)| Exchange { dialog, prediction })
        .collect();

    Ok(ChatRun { exchanges, elapsed })
}
