use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crmq::config::Config;
use crmq::crm::types::{Attachment, ClientInput, Contract, Invoice, ListParams, Specification, Upd};
use crmq::crm::{CrmApi, DocumentKind, HttpTransport};

#[derive(Parser, Debug)]
#[command(name = "crmq")]
#[command(about = "Query and edit CRM records from the command line")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/crmq/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// CRM site URL, overrides api.url
  #[arg(short, long)]
  url: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Clients
  Clients {
    #[command(subcommand)]
    action: ClientsCmd,
  },
  /// Contracts
  Contracts {
    #[command(subcommand)]
    action: DocumentsCmd,
  },
  /// Specifications
  Specifications {
    #[command(subcommand)]
    action: DocumentsCmd,
  },
  /// Invoices
  Invoices {
    #[command(subcommand)]
    action: DocumentsCmd,
  },
  /// UPD documents
  Upds {
    #[command(subcommand)]
    action: DocumentsCmd,
  },
  /// Extract document fields from a PDF
  Extract { file: PathBuf },
}

#[derive(Subcommand, Debug)]
enum ClientsCmd {
  List {
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value = "")]
    search: String,
  },
  Get {
    id: u64,
  },
  Create {
    name: String,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    phone: Option<String>,
    #[arg(long)]
    inn: Option<String>,
  },
  Delete {
    id: u64,
  },
}

#[derive(Subcommand, Debug)]
enum DocumentsCmd {
  List {
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value = "")]
    search: String,
  },
  Get {
    id: u64,
  },
  Delete {
    id: u64,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref(), args.url.as_deref())?;

  let _log_guard = crmq::logging::init(&config.log)?;

  let transport = HttpTransport::new(
    &config.api.url,
    Config::get_api_token(),
    config.request_timeout(),
  )?;
  let api = CrmApi::init(Arc::new(transport), config.cache_options())?;

  let result = run(&api, args.command).await;
  api.dispose();
  result
}

async fn run(api: &CrmApi, command: Command) -> Result<()> {
  match command {
    Command::Clients { action } => match action {
      ClientsCmd::List { page, search } => {
        let list = api.clients(&ListParams::new(page, search))?;
        print_json(&list.settled().await?)
      }
      ClientsCmd::Get { id } => print_json(&api.client(id)?.settled().await?),
      ClientsCmd::Create {
        name,
        email,
        phone,
        inn,
      } => {
        let input = ClientInput {
          name: Some(name),
          email,
          phone,
          inn,
          ..Default::default()
        };
        print_json(&api.create_client(&input).await?)
      }
      ClientsCmd::Delete { id } => {
        api.delete_client(id).await?;
        println!("Deleted client {}", id);
        Ok(())
      }
    },
    Command::Contracts { action } => documents::<Contract>(api, DocumentKind::Contract, action).await,
    Command::Specifications { action } => {
      documents::<Specification>(api, DocumentKind::Specification, action).await
    }
    Command::Invoices { action } => documents::<Invoice>(api, DocumentKind::Invoice, action).await,
    Command::Upds { action } => documents::<Upd>(api, DocumentKind::Upd, action).await,
    Command::Extract { file } => {
      let bytes = std::fs::read(&file).map_err(|e| eyre!("Failed to read {}: {}", file.display(), e))?;
      let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| eyre!("Not a file: {}", file.display()))?;
      print_json(&api.extract_pdf(&Attachment::pdf(name, bytes)).await?)
    }
  }
}

async fn documents<T>(api: &CrmApi, kind: DocumentKind, action: DocumentsCmd) -> Result<()>
where
  T: DeserializeOwned + Serialize,
{
  match action {
    DocumentsCmd::List { page, search } => {
      let list = api.documents::<T>(kind, &ListParams::new(page, search))?;
      print_json(&list.settled().await?)
    }
    DocumentsCmd::Get { id } => print_json(&api.document::<T>(kind, id)?.settled().await?),
    DocumentsCmd::Delete { id } => {
      api.delete_document(kind, id).await?;
      println!("Deleted {} {}", kind.tag_type().to_lowercase(), id);
      Ok(())
    }
  }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
