use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::StreamExt;
use inference::{
    ConversationContext, EngineConfig, FinishReason, GenerationEvent, GenerationService, LoadState,
    SamplingPolicy,
};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(author, version, about = "Chat with an on-device Gemi model", long_about = None)]
struct Cli {
    /// Directory with config.json, *.safetensors and tokenizer.json
    #[arg(short, long)]
    model_dir: Option<PathBuf>,

    /// Engine configuration (YAML)
    #[arg(short, long, default_value = "configs/engine.yaml")]
    config: PathBuf,

    /// Answer one prompt and exit instead of starting a chat
    #[arg(short, long)]
    prompt: Option<String>,

    /// System instruction placed before the conversation
    #[arg(short, long)]
    system: Option<String>,

    /// Note made available to the model; repeatable
    #[arg(long = "memory")]
    memories: Vec<String>,

    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long)]
    top_k: Option<usize>,

    #[arg(long)]
    top_p: Option<f32>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    max_new_tokens: Option<usize>,

    /// Skip the warm-up decode after loading
    #[arg(long)]
    no_warmup: bool,
}

impl Cli {
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = EngineConfig::load_or_default(&self.config)
            .with_context(|| format!("Failed to read engine config at {:?}", self.config))?;
        if let Some(dir) = &self.model_dir {
            config.model_dir = dir.clone();
        }
        if let Some(n) = self.max_new_tokens {
            config.max_new_tokens = n;
        }
        if self.no_warmup {
            config.warmup = false;
        }
        Ok(config)
    }

    fn policy(&self, defaults: &SamplingPolicy) -> SamplingPolicy {
        let mut policy = defaults.clone();
        if let Some(t) = self.temperature {
            policy.temperature = t;
        }
        if let Some(k) = self.top_k {
            policy.top_k = k;
        }
        if let Some(p) = self.top_p {
            policy.top_p = p;
        }
        if self.seed.is_some() {
            policy.seed = self.seed;
        }
        policy
    }

    fn context(&self) -> ConversationContext {
        let mut context = match &self.system {
            Some(system) => ConversationContext::with_system(system.clone()),
            None => ConversationContext::new(),
        };
        for memory in &self.memories {
            context.remember(memory.clone());
        }
        context
    }
}

async fn load(service: &GenerationService) -> Result<()> {
    let mut updates = service.load_model();
    while let Some(update) = updates.next().await {
        match update {
            Ok(status) if status.state == LoadState::Ready => eprintln!("\rLoading model... done"),
            Ok(status) => {
                eprint!("\rLoading model... {:>3.0}%", status.progress * 100.0);
                std::io::stderr().flush().ok();
            }
            Err(e) => {
                eprintln!();
                bail!("Failed to load model: {e}");
            }
        }
    }
    Ok(())
}

/// Stream one reply to stdout; ctrl-c stops it early.
async fn reply(
    service: &GenerationService,
    context: &ConversationContext,
    policy: &SamplingPolicy,
) -> Result<String> {
    let mut stream = service
        .generate(context.clone(), Some(policy.clone()))
        .await
        .context("Failed to start generation")?;
    let cancel = stream.cancel_handle();
    let mut text = String::new();
    let mut stdout = std::io::stdout();

    loop {
        let event = tokio::select! {
            event = stream.next() => event,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                continue;
            }
        };
        match event {
            Some(Ok(GenerationEvent::Token { text: piece, .. })) => {
                print!("{piece}");
                stdout.flush().ok();
                text.push_str(&piece);
            }
            Some(Ok(GenerationEvent::Done(summary))) => {
                println!();
                tracing::info!(
                    tokens = summary.generated_tokens,
                    prompt_tokens = summary.prompt_tokens,
                    elapsed_ms = summary.elapsed.as_millis() as u64,
                    reason = ?summary.reason,
                    "reply finished"
                );
                if summary.reason == FinishReason::ContextFull {
                    eprintln!("[context window full]");
                }
                break;
            }
            Some(Err(e)) => {
                println!();
                return Err(e).context("Generation failed");
            }
            None => break,
        }
    }
    Ok(text)
}

async fn chat(service: &GenerationService, mut context: ConversationContext, policy: SamplingPolicy) -> Result<()> {
    eprintln!("Type a message, /reset to start over, /health for status, /exit to quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("> ");
        std::io::stderr().flush().ok();
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/exit" | "/quit" => break,
            "/reset" => {
                context.turns.retain(|t| t.role == inference::Role::System);
                continue;
            }
            "/health" => {
                eprintln!("{}", serde_json::to_string_pretty(&service.health())?);
                continue;
            }
            _ => {}
        }
        context.user(line);
        match reply(service, &context, &policy).await {
            Ok(answer) => {
                context.assistant(answer);
            }
            Err(e) => {
                eprintln!("error: {e:#}");
                context.turns.pop();
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let config = cli.engine_config()?;
    let policy = cli.policy(&config.sampling);
    policy.validate().context("Invalid sampling settings")?;

    let service = GenerationService::from_config(&config);
    load(&service).await?;

    let mut context = cli.context();
    match &cli.prompt {
        Some(prompt) => {
            context.user(prompt.clone());
            reply(&service, &context, &policy).await?;
        }
        None => chat(&service, context, policy).await?,
    }
    Ok(())
}
