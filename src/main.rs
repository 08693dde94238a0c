use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use ticketgen::config::{DEFAULT_BASE_URL, ENV_BASE_URL};
use ticketgen::{
    ClientConfig, Notice, NoticeLevel, NoticeSink, SessionStatus, TicketClient,
    TicketDesk,
};

#[derive(Parser)]
#[command(name = "ticketgen", about = "Generate a ticket from a description and screenshots")]
struct Args {
    /// What the ticket should cover
    description: Option<String>,

    /// JPEG or PNG screenshot to attach; repeat for more (up to 10)
    #[arg(long = "image", short = 'i')]
    images: Vec<PathBuf>,

    /// Base URL of the generation service
    #[arg(long, env = ENV_BASE_URL, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Only check the service's health endpoint
    #[arg(long)]
    check: bool,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();
}

fn print_notice(notice: &Notice) {
    match notice.level {
        NoticeLevel::Info => eprintln!("info: {}", notice.message),
        NoticeLevel::Error => eprintln!("error: {}", notice.message),
    }
}

fn drain_notices(rx: &mut mpsc::UnboundedReceiver<Notice>) {
    while let Ok(notice) = rx.try_recv() {
        print_notice(&notice);
    }
}

// Print whatever arrived since the last call
fn print_new_text(text: &str, printed: &mut usize) -> std::io::Result<()> {
    if let Some(fresh) = text.get(*printed..).filter(|fresh| !fresh.is_empty()) {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(fresh.as_bytes())?;
        stdout.flush()?;
        *printed = text.len();
    }
    Ok(())
}

fn exit_code(status: SessionStatus) -> ExitCode {
    match status {
        SessionStatus::Completed => ExitCode::SUCCESS,
        SessionStatus::Cancelled => ExitCode::from(130),
        _ => ExitCode::from(1),
    }
}

// application entry point
#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_tracing();
    let args = Args::parse();

    let config = ClientConfig::new(&args.base_url)?;
    let client = TicketClient::new(config);

    if args.check {
        let healthy = client.health().await?;
        println!("{}", if healthy { "healthy" } else { "unhealthy" });
        return Ok(if healthy { ExitCode::SUCCESS } else { ExitCode::from(1) });
    }

    let (notices, mut notice_rx) = NoticeSink::channel();
    let mut desk = TicketDesk::new(Arc::new(client), notices);

    if !desk.stage_paths(&args.images).await {
        drain_notices(&mut notice_rx);
        return Ok(ExitCode::from(1));
    }

    let description = args.description.unwrap_or_default();
    let Some(handle) = desk.generate(&description).await else {
        drain_notices(&mut notice_rx);
        return Ok(ExitCode::from(1));
    };

    let mut text_rx: watch::Receiver<String> = desk.subscribe_text();
    let mut printed = 0;
    let wait = handle.wait();
    tokio::pin!(wait);

    let report = loop {
        tokio::select! {
            report = &mut wait => break report.context("generation task panicked")?,
            Ok(()) = text_rx.changed() => {
                let text = text_rx.borrow_and_update().clone();
                print_new_text(&text, &mut printed)?;
            }
            Some(notice) = notice_rx.recv() => print_notice(&notice),
            _ = tokio::signal::ctrl_c() => {
                desk.stop().await;
            }
        }
    };

    print_new_text(&report.text, &mut printed)?;
    if printed > 0 {
        println!();
    }
    drain_notices(&mut notice_rx);

    Ok(exit_code(report.status()))
}
