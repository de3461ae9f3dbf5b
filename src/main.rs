//! The `gattmitm` command line tool.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use gattmitm::api::bleuuid::parse_uuid;
use gattmitm::api::{AddressType, BDAddr, Connector};
use gattmitm::config::DeviceConfig;
use gattmitm::connector::BluezConnector;
use gattmitm::mgmt::MgmtClient;
use gattmitm::mitm::Mitm;
use gattmitm::{Error, Result};

/// Clone a BLE peripheral onto the local controller and relay all GATT
/// traffic to the real device.
#[derive(Parser, Debug)]
#[command(name = "gattmitm", version, about)]
struct Args {
    /// Local controller: index, device name ("hci0") or MAC address
    #[arg(long, value_name = "IFACE")]
    iface: Option<String>,

    /// MAC address of the device to impersonate
    #[arg(long, value_name = "MAC")]
    connectto: Option<BDAddr>,

    /// Do not connect upstream; serve entirely from a loaded snapshot
    #[arg(long)]
    noconnect: bool,

    /// Address type hint for the upstream connection (public or random)
    #[arg(long, value_name = "TYPE")]
    addrtype: Option<AddressType>,

    /// Override the advertised local name
    #[arg(long, value_name = "NAME")]
    advname: Option<String>,

    /// Override the advertised service UUIDs (16-bit or 128-bit, comma separated)
    #[arg(long, value_name = "UUID", value_delimiter = ',')]
    advserviceuuids: Vec<String>,

    /// Run the management helpers (btmgmt, hcitool) through sudo
    #[arg(long)]
    sudo: bool,

    /// Pin the advertising MAC address; without a value the adapter's own
    /// address is pinned
    #[arg(long, value_name = "MAC", num_args = 0..=1, default_missing_value = "adapter")]
    changemac: Option<String>,

    /// Store the cloned device as a snapshot file
    #[arg(long, value_name = "PATH")]
    devicestorepath: Option<PathBuf>,

    /// Load the device from a snapshot file instead of discovering it
    #[arg(long, value_name = "PATH")]
    deviceloadpath: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("cannot start the runtime: {}", err);
            return ExitCode::from(2);
        }
    };
    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            ExitCode::from(exit_code(&err))
        }
    }
}

fn init_logging() {
    let mut builder = pretty_env_logger::formatted_timed_builder();
    builder.filter_level(log::LevelFilter::Info);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}

/// Exit code 1 for anything the user can fix on the command line, 2 for
/// runtime failures.
fn exit_code(err: &Error) -> u8 {
    match err {
        Error::Configuration(_) | Error::ConnectFailed(_) | Error::DeviceNotFound(_) => 1,
        _ => 2,
    }
}

async fn run(args: Args) -> Result<()> {
    let config = args
        .deviceloadpath
        .as_deref()
        .map(DeviceConfig::load)
        .transpose()?;

    let session = bluer::Session::new().await?;
    let adapter = resolve_adapter(&session, args.iface.as_deref()).await?;
    let index = adapter_index(&adapter)?;
    info!("using adapter {} (index {})", adapter.name(), index);
    let mgmt = MgmtClient::new(index, args.sudo);

    let connector: Option<Arc<dyn Connector>> = if args.noconnect {
        None
    } else {
        let address = args
            .connectto
            .or_else(|| config.as_ref().and_then(|config| config.connectto))
            .ok_or_else(|| {
                Error::Configuration(
                    "an upstream address is required: pass --connectto, load a snapshot \
                     with one, or run with --noconnect"
                        .to_string(),
                )
            })?;
        Some(Arc::new(BluezConnector::new(address)?))
    };

    let mut mitm = Mitm::new(adapter.clone(), mgmt);
    mitm.configure(connector, config, args.addrtype).await?;

    if let Some(name) = &args.advname {
        mitm.set_adv_name(name)?;
    }
    if !args.advserviceuuids.is_empty() {
        let uuids = args
            .advserviceuuids
            .iter()
            .map(|text| {
                parse_uuid(text)
                    .ok_or_else(|| Error::Configuration(format!("bad service UUID {:?}", text)))
            })
            .collect::<Result<Vec<_>>>()?;
        mitm.set_adv_service_uuids(&uuids)?;
    }
    if let Some(changemac) = &args.changemac {
        let address = if changemac == "adapter" {
            BDAddr::from(adapter.address().await?.0)
        } else {
            changemac.parse().map_err(|err| {
                Error::Configuration(format!("bad --changemac value: {}", err))
            })?
        };
        mitm.set_pinned_address(address)?;
    }
    if let Some(path) = &args.devicestorepath {
        mitm.snapshot().await?.store(path)?;
    }

    let outcome = match mitm.start().await {
        Ok(()) => mitm.run().await,
        Err(err) => Err(err),
    };
    mitm.stop().await;
    outcome
}

/// Pick the local controller: an explicit index, `hciN` name or MAC, or
/// the only (or default) adapter when unspecified.
async fn resolve_adapter(session: &bluer::Session, iface: Option<&str>) -> Result<bluer::Adapter> {
    let Some(spec) = iface else {
        let names = session.adapter_names().await?;
        return Ok(match names.as_slice() {
            [only] => session.adapter(only)?,
            _ => session.default_adapter().await?,
        });
    };
    if let Ok(index) = spec.parse::<u16>() {
        return Ok(session.adapter(&format!("hci{}", index))?);
    }
    if spec.starts_with("hci") {
        return Ok(session.adapter(spec)?);
    }
    if let Ok(address) = spec.parse::<BDAddr>() {
        for name in session.adapter_names().await? {
            let adapter = session.adapter(&name)?;
            if BDAddr::from(adapter.address().await?.0) == address {
                return Ok(adapter);
            }
        }
        return Err(Error::Configuration(format!(
            "no adapter with address {}",
            address
        )));
    }
    Err(Error::Configuration(format!(
        "cannot interpret interface {:?}: expected an index, hciN or a MAC",
        spec
    )))
}

/// The numeric index the management tools address the adapter by.
fn adapter_index(adapter: &bluer::Adapter) -> Result<u16> {
    let name = adapter.name();
    name.strip_prefix("hci")
        .and_then(|index| index.parse().ok())
        .ok_or_else(|| {
            Error::Configuration(format!("cannot derive an hci index from {:?}", name))
        })
}
