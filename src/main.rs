use std::io::Write as _;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

use dbpilot::adapters::BackendKind;
use dbpilot::error::friendly_message;
use dbpilot::llm::{HttpLlmClient, LlmConfig, DEFAULT_BASE_URL};
use dbpilot::session::{Session, StreamEvent};

/// Chat with your database in plain language
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Database backend: postgres, mysql, sqlite or mongodb
    #[arg(long)]
    db_type: BackendKind,

    /// Connection URL, e.g. postgres://user:pw@localhost/mydb or sqlite:///app.db
    #[arg(long)]
    db_url: String,

    /// Model to use for the conversation
    #[arg(long, default_value = "gpt-4o-mini")]
    model: String,

    /// OpenAI-compatible API base URL
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Print complete answers instead of streaming tokens
    #[arg(long)]
    no_stream: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup logging
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let api_key = std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY is not set")?;
    let config = LlmConfig::new(api_key, cli.model).with_base_url(cli.base_url);
    let mut session = Session::new(Box::new(HttpLlmClient::new(config)));

    let outcome = session
        .connect(cli.db_type, &cli.db_url)
        .await
        .map_err(|e| anyhow::anyhow!("{}", friendly_message(&e.to_string())))?;
    println!("{} ({} tools available)", outcome.status, outcome.tool_names.len());
    println!("Type a question, or 'quit' to exit.");

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }

        if cli.no_stream {
            match session.process_query(line).await {
                Ok(answer) => println!("{}", answer.response),
                Err(e) => eprintln!("error: {}", friendly_message(&e.to_string())),
            }
            continue;
        }

        // Print tokens as they arrive; the turn itself runs on this task so
        // the printer only needs to drain the channel until Done.
        let (tx, mut rx) = mpsc::channel(64);
        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    StreamEvent::Content(token) => {
                        print!("{}", token);
                        let _ = std::io::stdout().flush();
                    }
                    StreamEvent::Done => break,
                }
            }
        });
        let result = session.process_query_stream(line, &tx).await;
        drop(tx);
        let _ = printer.await;
        println!();
        if let Err(e) = result {
            eprintln!("error: {}", friendly_message(&e.to_string()));
        }
    }

    session.disconnect().await?;
    Ok(())
}
