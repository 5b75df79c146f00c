use clap::{Parser, Subcommand};
use newsletter_sync::{
    app::App,
    config::Settings,
    oauth::OAuthTokens,
    queue::Priority,
};
use std::{path::PathBuf, time::Duration};

#[derive(Parser)]
#[command(version, about = "Keeps Gmail newsletter labels synced into a local database")]
struct Args {
    #[command(flatten)]
    settings: Settings,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run scheduled syncs until interrupted
    Run {
        /// Queue every subscription at low priority on startup
        #[arg(long)]
        refresh_all: bool,
    },
    /// Sync one subscription now and wait for the outcome
    Refresh { id: String },
    /// Track a Gmail label as a newsletter
    Subscribe {
        id: String,
        label: String,
        #[arg(long)]
        interval_minutes: Option<u64>,
    },
    /// Stop tracking a newsletter and delete its stored messages
    Unsubscribe { id: String },
    /// List the account's Gmail labels
    Labels,
    /// Store a token set obtained from an external consent flow
    ImportTokens { file: PathBuf },
    /// Delete the stored credential
    SignOut,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();
    setup_logging();

    let config = args.settings.validate()?;
    let app = App::open(config)?;

    match args.command {
        Command::Run { refresh_all } => {
            app.start().await?;
            if refresh_all {
                let tasks = app.refresh_all().await?;
                tracing::info!(queued = tasks.len(), "refresh-all queued");
            }
            tokio::signal::ctrl_c().await?;
            tracing::info!("interrupted, shutting down");
            app.shutdown().await;
        }
        Command::Refresh { id } => {
            let mut results = app.results();
            app.queue().start();
            let task = app.refresh(&id.as_str().into(), Priority::High)?;
            let result = app.queue().wait_for(&mut results, task).await?;
            app.shutdown().await;
            match result.error {
                None => println!(
                    "{}: {} new messages ({} attempts)",
                    result.subscription_id, result.new_message_count, result.attempts
                ),
                Some(err) => eyre::bail!("{}: {err}", result.subscription_id),
            }
        }
        Command::Subscribe {
            id,
            label,
            interval_minutes,
        } => {
            let interval = match interval_minutes {
                Some(minutes) => match minutes.checked_mul(60) {
                    Some(secs) => Some(Duration::from_secs(secs)),
                    None => eyre::bail!("interval of {minutes} minutes is too long"),
                },
                None => None,
            };
            let subscription = app
                .subscribe(id.into(), label.into(), interval)
                .await?;
            println!(
                "{} -> {} every {} minutes",
                subscription.id,
                subscription.label_id,
                subscription.interval.as_secs() / 60
            );
        }
        Command::Unsubscribe { id } => {
            if !app.unsubscribe(&id.into()).await? {
                eyre::bail!("no such subscription");
            }
        }
        Command::Labels => {
            for label in app.labels().await? {
                let kind: &'static str = label.r#type.into();
                println!("{}\t{}\t{kind}", label.id, label.name);
            }
        }
        Command::ImportTokens { file } => {
            let tokens = OAuthTokens::load_from_file(file)?;
            app.import_tokens(tokens).await?;
            tracing::info!("tokens imported");
        }
        Command::SignOut => {
            app.sign_out().await?;
        }
    }

    Ok(())
}

fn setup_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();
}
