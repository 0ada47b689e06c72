//! `agent-run`: start, stop, inspect and follow agent runs from a terminal.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agent_run_client::observability::init_observability;
use agent_run_client::prelude::*;
use agent_run_client::{
    Attachment, BackendConfig, EnvTokenProvider, ReasoningEffort, ReqwestTransport,
};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "agent-run")]
#[command(about = "Control and follow background agent runs", version)]
struct Cli {
    /// Backend base URL; defaults to AGENT_RUN_BACKEND_URL.
    #[arg(long, global = true)]
    backend_url: Option<String>,

    /// Control-plane request timeout in seconds.
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check that the backend is up.
    Health,
    /// Start a run on an existing thread and print its id.
    Start {
        thread_id: String,
        #[command(flatten)]
        options: RunOptionArgs,
        /// Follow the run's output after starting it.
        #[arg(long)]
        follow: bool,
    },
    /// Stop a run.
    Stop { run_id: String },
    /// Print a run's record.
    Status { run_id: String },
    /// List the runs of a thread.
    Runs { thread_id: String },
    /// Print a run's output as it arrives.
    Stream { run_id: String },
    /// Create a thread from a prompt and start its first run.
    Initiate {
        prompt: String,
        /// Files to attach to the first turn.
        #[arg(long = "file")]
        files: Vec<PathBuf>,
        #[command(flatten)]
        options: RunOptionArgs,
    },
}

#[derive(Debug, Args)]
struct RunOptionArgs {
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    thinking: bool,
    #[arg(long)]
    effort: Option<ReasoningEffort>,
    #[arg(long)]
    stream: bool,
}

impl RunOptionArgs {
    fn to_options(&self) -> StartOptions {
        let mut options = StartOptions::default();
        if let Some(model) = &self.model {
            options = options.model_name(model);
        }
        if self.thinking {
            options = options.enable_thinking(true);
        }
        if let Some(effort) = self.effort {
            options = options.reasoning_effort(effort);
        }
        if self.stream {
            options = options.stream(true);
        }
        options
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    init_observability();

    let cli = Cli::parse();
    let client = build_client(&cli)?;
    tracing::debug!(command = ?cli.command, event = "cli.command", "running command");
    let result = run(&client, cli.command).await;
    client.shutdown();
    result
}

fn build_client(cli: &Cli) -> Result<RunSessionClient, RunSessionError> {
    let mut config = match &cli.backend_url {
        Some(url) => BackendConfig::new(url.as_str()),
        None => BackendConfig::from_env()?,
    };
    if let Some(secs) = cli.timeout_secs {
        config = config.timeout(Duration::from_secs(secs));
    }
    RunSessionClient::builder()
        .stream_buffer_capacity(config.stream_buffer_capacity)
        .transport(Arc::new(ReqwestTransport::new(config)?))
        .token_provider(Arc::new(EnvTokenProvider::default()))
        .build()
}

async fn run(
    client: &RunSessionClient,
    command: Command,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Health => print_json(&client.health().await?)?,
        Command::Start {
            thread_id,
            options,
            follow,
        } => {
            let run_id = client
                .start(&ThreadId::new(thread_id), &options.to_options())
                .await?;
            println!("{run_id}");
            if follow {
                follow_run(client, run_id).await?;
            }
        }
        Command::Stop { run_id } => {
            client.stop(&RunId::new(run_id)).await?;
            println!("stopped");
        }
        Command::Status { run_id } => print_json(&client.get_status(&RunId::new(run_id)).await?)?,
        Command::Runs { thread_id } => {
            print_json(&client.list_runs(&ThreadId::new(thread_id)).await?)?
        }
        Command::Stream { run_id } => follow_run(client, RunId::new(run_id)).await?,
        Command::Initiate {
            prompt,
            files,
            options,
        } => {
            let mut request = InitiateRequest::new(prompt).options(options.to_options());
            for path in files {
                request = request.attach(read_attachment(&path)?);
            }
            print_json(&client.initiate(&request).await?)?;
        }
    }
    Ok(())
}

async fn follow_run(client: &RunSessionClient, run_id: RunId) -> Result<(), RunSessionError> {
    let mut subscription = client.subscribe(run_id);
    while let Some(event) = subscription.next_event().await {
        match event {
            SubscriptionEvent::Message(raw) => println!("{raw}"),
            SubscriptionEvent::Error(error) => return Err(error),
            SubscriptionEvent::Closed => break,
        }
    }
    Ok(())
}

fn read_attachment(path: &Path) -> Result<Attachment, std::io::Error> {
    let bytes = std::fs::read(path)?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".to_string());
    Ok(Attachment::new(file_name, bytes))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
