//! textnow-bridge CLI
//!
//! Runs the polling daemon for one TextNow account, or performs one-off
//! sends, menus and contact edits against its state file.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use textnow_bridge::client::{TextNowClient, VendorApi};
use textnow_bridge::config::Config;
use textnow_bridge::coordinator::Coordinator;
use textnow_bridge::events::EventBus;
use textnow_bridge::integration::Integration;
use textnow_bridge::phone::{format_phone, is_valid_phone};
use textnow_bridge::services::{Recipient, SendArgs, SendMenuArgs, Services};
use textnow_bridge::store::{JsonFileStore, StateStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// TextNow SMS bridge
#[derive(Parser)]
#[command(name = "textnow-bridge")]
#[command(about = "Poll a TextNow account and send SMS, MMS and menus")]
struct Cli {
    /// Config file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll continuously until Ctrl-C
    Run,

    /// Run a single poll cycle and print the events it produced
    Poll,

    /// Send a message to a contact id or phone number
    Send {
        /// Contact id or phone number
        to: String,

        /// SMS text (also the MMS caption)
        #[arg(short, long, default_value = "")]
        message: String,

        /// Image to send as MMS
        #[arg(long)]
        image: Option<String>,

        /// Audio file to send as a voice message
        #[arg(long)]
        voice: Option<String>,
    },

    /// Send a numbered menu and wait for the choice
    Menu {
        /// Contact id or phone number
        to: String,

        /// Menu options, in order
        #[arg(required = true)]
        options: Vec<String>,

        /// Seconds to wait for a reply
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Omit the header and footer
        #[arg(long)]
        bare: bool,
    },

    /// Manage the address book
    Contacts {
        #[command(subcommand)]
        action: ContactsAction,
    },

    /// Print the canonical form of a phone number
    FormatPhone {
        phone: String,
    },
}

#[derive(Subcommand)]
enum ContactsAction {
    /// List contacts
    List,

    /// Add a contact
    Add { name: String, phone: String },

    /// Remove a contact and its pending prompts and context
    Remove { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so command output stays clean
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::FormatPhone { phone } = &cli.command {
        println!("{}", format_phone(phone)?);
        return Ok(());
    }

    let path = cli.config.unwrap_or_else(Config::default_path);
    let config =
        Config::load(&path).with_context(|| format!("loading config {}", path.display()))?;

    match cli.command {
        Commands::Run => cmd_run(config).await,
        Commands::Poll => cmd_poll(config).await,
        Commands::Send {
            to,
            message,
            image,
            voice,
        } => cmd_send(config, &to, message, image, voice).await,
        Commands::Menu {
            to,
            options,
            timeout,
            bare,
        } => cmd_menu(config, &to, options, timeout, bare).await,
        Commands::Contacts { action } => cmd_contacts(config, action).await,
        Commands::FormatPhone { .. } => Ok(()),
    }
}

/// Known contact ids win; otherwise phone numbers go to `phone` and
/// anything else is treated as a contact id
async fn recipient(store: &StateStore, to: &str) -> anyhow::Result<Recipient> {
    if store.contact(to).await?.is_some() || !is_valid_phone(to) {
        Ok(Recipient::contact(to))
    } else {
        Ok(Recipient::phone(to))
    }
}

struct Parts {
    config: Arc<Config>,
    store: Arc<StateStore>,
    api: Arc<dyn VendorApi>,
    bus: EventBus,
}

fn parts(config: Config) -> Parts {
    let store = Arc::new(StateStore::new(Arc::new(JsonFileStore::for_instance(
        &config.state_dir,
        &config.instance_id,
    ))));
    let api: Arc<dyn VendorApi> = Arc::new(TextNowClient::new(&config));
    Parts {
        config: Arc::new(config),
        store,
        api,
        bus: EventBus::new(),
    }
}

fn services(parts: &Parts) -> Services {
    Services::new(
        Arc::clone(&parts.config),
        Arc::clone(&parts.store),
        Arc::clone(&parts.api),
        parts.bus.clone(),
    )
}

async fn cmd_run(config: Config) -> anyhow::Result<()> {
    let integration = Integration::from_config(config)
        .await
        .context("setting up TextNow")?;
    integration.start();
    info!(
        contacts = integration.sensors().len(),
        "Running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("Shutting down");
    integration.unload().await;
    Ok(())
}

async fn cmd_poll(config: Config) -> anyhow::Result<()> {
    let parts = parts(config);
    let _printer = parts.bus.subscribe_all(|event| {
        println!("{} {}", event.name(), event.payload());
    });
    let coordinator = Coordinator::new(
        Arc::clone(&parts.config),
        Arc::clone(&parts.store),
        Arc::clone(&parts.api),
        parts.bus.clone(),
    );

    let report = coordinator.poll_cycle().await;
    parts.api.shutdown().await;
    let report = report?;
    println!(
        "fetched={} received={} replies={} duplicates={} unauthorized={} expired={}",
        report.fetched,
        report.received,
        report.replies,
        report.duplicates,
        report.unauthorized,
        report.expired
    );
    Ok(())
}

async fn cmd_send(
    config: Config,
    to: &str,
    message: String,
    image: Option<String>,
    voice: Option<String>,
) -> anyhow::Result<()> {
    let parts = parts(config);
    let to_recipient = recipient(&parts.store, to).await?;
    let result = services(&parts)
        .send(SendArgs {
            to: to_recipient,
            message,
            mms_image: image,
            voice_audio: voice,
        })
        .await;
    parts.api.shutdown().await;
    result?;
    println!("Sent to {}", to);
    Ok(())
}

async fn cmd_menu(
    config: Config,
    to: &str,
    options: Vec<String>,
    timeout: Option<u64>,
    bare: bool,
) -> anyhow::Result<()> {
    let integration = Integration::from_config(config)
        .await
        .context("setting up TextNow")?;
    integration.start();

    let to_recipient = match recipient(integration.store(), to).await {
        Ok(r) => r,
        Err(e) => {
            integration.unload().await;
            return Err(e);
        }
    };
    let mut args = SendMenuArgs::new(to_recipient, options);
    args.timeout = timeout;
    args.include_header = !bare;
    args.include_footer = !bare;
    let result = integration.services().send_menu(args).await;
    integration.unload().await;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

async fn cmd_contacts(config: Config, action: ContactsAction) -> anyhow::Result<()> {
    let parts = parts(config);
    let services = services(&parts);

    match action {
        ContactsAction::List => {
            let contacts = parts.store.contacts().await?;
            if contacts.is_empty() {
                println!("No contacts");
            }
            for c in contacts {
                println!("{}\t{}\t{}", c.id, c.name, c.phone);
            }
        }
        ContactsAction::Add { name, phone } => {
            let contact = services.add_contact(&name, &phone).await?;
            println!("Added {} ({})", contact.id, contact.phone);
        }
        ContactsAction::Remove { id } => {
            if id.trim().is_empty() {
                bail!("contact id is required");
            }
            let contact = services.delete_contact(&id).await?;
            println!("Removed {} ({})", contact.id, contact.name);
        }
    }
    Ok(())
}
