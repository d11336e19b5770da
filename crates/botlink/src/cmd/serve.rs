use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use botlink_host::{HostConfig, HostServer};
use tracing::{info, warn};

use crate::cmd::ServeArgs;
use crate::exit::{host_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_message, OutputFormat, Received};

const IDLE_TICK: Duration = Duration::from_millis(20);

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let config = resolve_config(&args)?;
    let types = config.type_range();

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let server = HostServer::builder(config)
        .on_disconnect(|client, reason| info!(%client, %reason, "robot left"))
        .start()
        .map_err(|err| host_error("start failed", err))?;
    info!(addr = %server.local_addr(), "serving");

    let printed = Arc::new(AtomicUsize::new(0));
    for type_id in types.first()..=types.last() {
        let printed = Arc::clone(&printed);
        let running = Arc::clone(&running);
        let handle = server.handle().clone();
        let echo = args.echo;
        let count = args.count;

        server.dispatcher().register(type_id, move |msg| {
            let from = msg.client.to_string();
            print_message(
                Received {
                    from: &from,
                    type_id: msg.type_id(),
                    sequence: Some(msg.sequence()),
                    payload: msg.payload(),
                },
                format,
            );

            if echo {
                if let Err(err) = handle.send(msg.client, msg.type_id(), msg.payload().clone()) {
                    warn!(client = %msg.client, error = %err, "echo failed");
                }
            }

            let total = printed.fetch_add(1, Ordering::SeqCst) + 1;
            if count.is_some_and(|limit| total >= limit) {
                running.store(false, Ordering::SeqCst);
            }
        });
    }

    if let Some(allowed) = args.allow {
        info!(allowed = ?allowed, "blocking mode on");
        server.dispatcher().enter_blocking(allowed);
    }

    while running.load(Ordering::SeqCst) {
        thread::sleep(IDLE_TICK);
    }

    drop(server);
    Ok(SUCCESS)
}

fn resolve_config(args: &ServeArgs) -> CliResult<HostConfig> {
    let mut config = match &args.config {
        Some(path) => {
            HostConfig::from_json_file(path).map_err(|err| host_error("config failed", err))?
        }
        None => HostConfig::default(),
    };

    if let Some(bind) = &args.bind {
        config.bind = bind.clone();
    }
    if let Some(max_clients) = args.max_clients {
        config.max_clients = max_clients;
    }
    if let Some(framing) = args.framing {
        config.framing = framing;
    }
    if let Some(checksum) = args.checksum {
        config.checksum = checksum;
    }
    Ok(config)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

#[cfg(test)]
mod tests {
    use botlink_frame::{ChecksumKind, Framing};

    use super::*;

    fn args() -> ServeArgs {
        ServeArgs {
            bind: None,
            config: None,
            max_clients: None,
            framing: None,
            checksum: None,
            echo: false,
            allow: None,
            count: None,
        }
    }

    #[test]
    fn flags_override_defaults() {
        let config = resolve_config(&ServeArgs {
            bind: Some("127.0.0.1:9000".into()),
            max_clients: Some(3),
            framing: Some(Framing::Delimited),
            checksum: Some(ChecksumKind::Xor),
            ..args()
        })
        .unwrap();

        assert_eq!(config.bind, "127.0.0.1:9000");
        assert_eq!(config.max_clients, 3);
        assert_eq!(config.framing, Framing::Delimited);
        assert_eq!(config.checksum, ChecksumKind::Xor);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = resolve_config(&ServeArgs {
            config: Some("/nonexistent/botlink-host.json".into()),
            ..args()
        })
        .unwrap_err();
        assert!(err.message.starts_with("config failed"));
    }
}
