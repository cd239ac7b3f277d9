#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

use std::{io::Read, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use mailparse::{MailAddr, MailHeaderMap};
use pmta::{
    internal, Config, Connection, Engine, Error, MemoryEngine, Message, NativeEngine, Notify,
    Recipient, Target,
};

/// Submit an RFC 5322 message through a PowerMTA server
#[derive(Parser, Debug)]
#[command(name = "pmta-submit")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to $PMTA_CONFIG, ./pmta.toml, /etc/pmta/pmta.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Submission engine shared library, overriding the configuration
    #[arg(long)]
    library: Option<PathBuf>,

    #[arg(short, long)]
    server: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(short, long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Envelope sender (defaults to the message's From: address)
    #[arg(short, long)]
    from: Option<String>,

    #[arg(long)]
    envelope_id: Option<String>,

    /// Virtual MTA to deliver through
    #[arg(long)]
    vmta: Option<String>,

    #[arg(long)]
    job_id: Option<String>,

    /// Delivery notifications, e.g. `failure,delay`
    #[arg(long, value_parser = parse_notify)]
    notify: Option<Notify>,

    /// Template variable applied to every recipient, as `name=value`
    #[arg(long = "var", value_parser = parse_variable)]
    variables: Vec<(String, String)>,

    /// Read the message from a file instead of stdin
    #[arg(short, long)]
    message: Option<PathBuf>,

    /// Build and submit against an in-memory engine instead of a server
    #[arg(long)]
    dry_run: bool,

    #[arg(required = true)]
    recipients: Vec<String>,
}

fn parse_notify(value: &str) -> Result<Notify, String> {
    value
        .split(',')
        .map(|flag| match flag.trim().to_ascii_lowercase().as_str() {
            "never" => Ok(Notify::NEVER),
            "success" => Ok(Notify::SUCCESS),
            "failure" => Ok(Notify::FAILURE),
            "delay" => Ok(Notify::DELAY),
            "always" => Ok(Notify::ALWAYS),
            other => Err(format!("unknown notification '{other}'")),
        })
        .try_fold(Notify::NEVER, |mask, flag| flag.map(|flag| mask | flag))
}

fn parse_variable(value: &str) -> Result<(String, String), String> {
    value
        .split_once('=')
        .map(|(name, value)| (name.to_owned(), value.to_owned()))
        .ok_or_else(|| format!("expected name=value, got '{value}'"))
}

/// The first address of the message's `From:` header.
fn originator(headers: &[mailparse::MailHeader<'_>]) -> anyhow::Result<String> {
    let from = headers
        .get_first_value("From")
        .context("no --from given and the message has no From: header")?;

    let addresses = mailparse::addrparse(&from)
        .with_context(|| format!("unable to parse From: header '{from}'"))?;

    addresses
        .iter()
        .find_map(|address| match address {
            MailAddr::Single(single) => Some(single.addr.clone()),
            MailAddr::Group(group) => group.addrs.first().map(|single| single.addr.clone()),
        })
        .with_context(|| format!("From: header '{from}' holds no address"))
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let path = match &cli.config {
        Some(path) => Some(path.clone()),
        None => Config::locate()?,
    };

    Ok(match path {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    })
}

fn run<E: Engine>(
    engine: &Arc<E>,
    config: &Config,
    cli: &Cli,
    raw: &[u8],
    originator: &str,
    dated: bool,
) -> anyhow::Result<()> {
    let policy = config.policy();

    let mut message = Message::new(engine, originator)?;
    if !message.is_ready() {
        let err = message
            .last_error()
            .context("message initialisation failed")?;
        return Err(err.into());
    }

    if let Some(envelope_id) = &cli.envelope_id {
        message.set_envelope_id(envelope_id)?;
    }
    if let Some(vmta) = &cli.vmta {
        message.set_virtual_mta(vmta)?;
    }
    if let Some(job_id) = &cli.job_id {
        message.set_job_id(job_id)?;
    }

    for address in &cli.recipients {
        let mut recipient = Recipient::new(engine, address)?;
        let prepared = recipient_setup(&mut recipient, cli);

        let bound = prepared.and_then(|()| {
            message
                .add_recipient(recipient)
                .map(|_| ())
                .map_err(Error::from)
        });

        if policy.check(bound)? {
            internal!(level = DEBUG, "recipient {address} added");
        } else {
            internal!(level = WARN, "skipping recipient {address}");
        }
    }

    if message.recipients().is_empty() {
        anyhow::bail!("no recipient was accepted");
    }

    if !dated {
        message.add_date_header()?;
    }
    message.add_data(raw)?;

    let mut connection = Connection::open(
        engine,
        config,
        &Target::default()
            .server(cli.server.clone().unwrap_or_default())
            .port(cli.port.unwrap_or_default())
            .username(cli.username.clone().unwrap_or_default())
            .password(cli.password.clone().unwrap_or_default()),
    )?;

    if let Some(err) = connection.connect_error() {
        anyhow::bail!(err.clone());
    }

    connection.submit(&message)?;

    println!(
        "submitted message from {originator} for {} recipient(s) to {}:{}",
        message.recipients().len(),
        connection.server(),
        connection.port()
    );

    Ok(())
}

fn recipient_setup<E: Engine>(recipient: &mut Recipient<E>, cli: &Cli) -> pmta::Result<()> {
    if let Some(err) = recipient.last_error().filter(|_| !recipient.is_ready()) {
        return Err(err);
    }

    if let Some(notify) = cli.notify {
        recipient.set_notify(notify)?;
    }

    for (name, value) in &cli.variables {
        recipient.define_variable(name, value)?;
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    pmta::logging::init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let mut raw = Vec::new();
    match &cli.message {
        Some(path) => {
            raw = std::fs::read(path)
                .with_context(|| format!("unable to read message from {}", path.display()))?;
        }
        None => {
            std::io::stdin()
                .read_to_end(&mut raw)
                .context("unable to read message from stdin")?;
        }
    }

    let (headers, _) = mailparse::parse_headers(&raw).context("malformed message headers")?;
    let originator = match &cli.from {
        Some(from) => from.clone(),
        None => originator(&headers)?,
    };
    let dated = headers.get_first_header("Date").is_some();

    if cli.dry_run {
        let engine = Arc::new(MemoryEngine::new());
        run(&engine, &config, &cli, &raw, &originator, dated)?;

        for submission in engine.submissions() {
            internal!(
                level = INFO,
                "dry run: {} bytes from {} to {:?}",
                submission.body.len(),
                submission.originator,
                submission
                    .recipients
                    .iter()
                    .map(|delivery| delivery.address.as_str())
                    .collect::<Vec<_>>()
            );
        }

        return Ok(());
    }

    let library = cli
        .library
        .clone()
        .or_else(|| config.library.clone())
        .context("no submission engine library configured; set `library` or pass --library")?;

    let engine = Arc::new(NativeEngine::load(library)?);
    run(&engine, &config, &cli, &raw, &originator, dated)
}
