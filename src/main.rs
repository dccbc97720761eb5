use anyhow::Result;
use clap::{Parser, ValueEnum};
use llama_chat::config::Config;
use llama_chat::dialog;
use llama_chat::generator::{BuildParams, CompletionOptions, LlamaServerGenerator, StartState};
use llama_chat::output;
use llama_chat::session;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Parser)]
#[command(
    name = "llama-chat",
    about = "Run chat completion on a Llama chat model and print the transcript with timing"
)]
struct Cli {
    /// Directory containing the checkpoint shards (*.pth or *.gguf)
    #[arg(long, alias = "ckpt_dir")]
    ckpt_dir: PathBuf,

    /// Path to the tokenizer model
    #[arg(long, alias = "tokenizer_path")]
    tokenizer_path: PathBuf,

    /// Sampling temperature [default: 0.6]
    #[arg(long)]
    temperature: Option<f32>,

    /// Nucleus sampling threshold [default: 0.9]
    #[arg(long, alias = "top_p")]
    top_p: Option<f32>,

    /// Maximum sequence length, prompt plus generation [default: 512]
    #[arg(long, alias = "max_seq_len")]
    max_seq_len: Option<usize>,

    /// Maximum number of dialogs per completion call [default: 8]
    #[arg(long, alias = "max_batch_size")]
    max_batch_size: Option<usize>,

    /// Maximum generated tokens [default: max_seq_len - 1]
    #[arg(long, alias = "max_gen_len")]
    max_gen_len: Option<usize>,

    /// Sampling seed [default: 1]
    #[arg(long)]
    seed: Option<u32>,

    /// JSON file with dialogs to complete instead of the built-in demo
    #[arg(long)]
    dialogs: Option<PathBuf>,

    /// Restore the server slot's saved start state before generating
    #[arg(long, alias = "load_start_state")]
    load_start_state: bool,

    /// Save the server slot's state after generating
    #[arg(long, alias = "save_start_state")]
    save_start_state: bool,

    /// Inference server URL (overrides config and LLAMA_SERVER_URL)
    #[arg(long)]
    server_url: Option<String>,

    /// Path to config file, used only if it exists
    #[arg(short, long, default_value = "llama-chat.toml")]
    config: PathBuf,

    /// Output format
    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,
}

impl Cli {
    /// Both off unless asked for: a restore fails when nothing has been saved yet.
    fn start_state(&self) -> StartState {
        StartState {
            load: self.load_start_state,
            save: self.save_start_state,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("llama_chat=info")),
        )
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let start_state = cli.start_state();

    let mut cfg = Config::load_or_default(&cli.config)?;
    if let Some(url) = cli.server_url {
        cfg.server.base_url = url;
    }
    if let Some(t) = cli.temperature {
        cfg.sampling.temperature = t;
    }
    if let Some(p) = cli.top_p {
        cfg.sampling.top_p = p;
    }
    if let Some(n) = cli.max_seq_len {
        cfg.sampling.max_seq_len = n;
    }
    if let Some(n) = cli.max_batch_size {
        cfg.sampling.max_batch_size = n;
    }
    if let Some(n) = cli.max_gen_len {
        cfg.sampling.max_gen_len = Some(n);
    }
    if let Some(seed) = cli.seed {
        cfg.sampling.seed = Some(seed);
    }
    cfg.validate()?;

    let dialogs = match &cli.dialogs {
        Some(path) => dialog::load_dialogs(path)?,
        None => dialog::demo_dialogs()?,
    };

    let params = BuildParams {
        ckpt_dir: cli.ckpt_dir,
        tokenizer_path: cli.tokenizer_path,
        max_seq_len: cfg.sampling.max_seq_len,
        max_batch_size: cfg.sampling.max_batch_size,
    };
    let generator = LlamaServerGenerator::build(&params, &cfg.server).await?;

    let options = CompletionOptions {
        max_gen_len: cfg.sampling.max_gen_len,
        temperature: cfg.sampling.temperature,
        top_p: cfg.sampling.top_p,
        seed: cfg.sampling.seed,
        start_state,
    };
    let run = session::run(&generator, dialogs, &options).await?;

    match cli.format {
        Format::Text => print!("{}", output::render_text(&run)),
        Format::Json => println!("{}", output::render_json(&run)?),
    }
    Ok(())
}
