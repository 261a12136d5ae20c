use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};

use switchyard::broker::{AckMode, Broker, Delivery, ExchangeKind, ExchangeOptions, QueueOptions};
use switchyard::config::load_config;
use switchyard::dispatcher::{ConsumerHandler, Dispatcher, DispatcherHandle, HandlerError};
use switchyard::persistence::SledStore;
use switchyard::utils::{BrokerError, logging};

/// Prints every delivery it receives. Backs the `listen` command.
struct PrintHandler;

#[async_trait]
impl ConsumerHandler for PrintHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        println!(
            "[{}] {}",
            delivery.queue,
            String::from_utf8_lossy(&delivery.message.payload)
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let settings = load_config().expect("Failed to load configuration");
    logging::init(&settings.log.level);

    let broker = if settings.persistence.enabled {
        let store =
            SledStore::open(&settings.persistence.path).expect("Failed to open the message store");
        Arc::new(Broker::with_persistence(settings.broker.clone(), Arc::new(store)))
    } else {
        Arc::new(Broker::with_settings(settings.broker.clone()))
    };
    broker
        .install_topology(&settings.topology)
        .expect("Failed to install the configured topology");

    println!("switchyard ready, type `help` for commands");
    let mut listener: Option<DispatcherHandle> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => break,
            },
        };
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            [] => {}
            ["help"] => print_help(),
            ["quit"] | ["exit"] => break,
            ["declare-exchange", name, kind] => {
                let kind = match *kind {
                    "direct" => ExchangeKind::Direct,
                    "fanout" => ExchangeKind::Fanout,
                    "topic" => ExchangeKind::Topic,
                    other => {
                        println!("unknown exchange kind `{other}`");
                        continue;
                    }
                };
                report(broker.declare_exchange(name, kind, ExchangeOptions::default()));
            }
            ["declare-queue", name] => {
                report(broker.declare_queue(name, QueueOptions::default()));
            }
            ["declare-queue", name, max] => match max.parse::<usize>() {
                Ok(max) => {
                    report(broker.declare_queue(name, QueueOptions::default().with_max_length(max)))
                }
                Err(_) => println!("max-length must be a number, got `{max}`"),
            },
            ["bind", exchange, queue, pattern] => {
                report(broker.bind(exchange, queue, pattern));
            }
            ["unbind", exchange, queue, pattern] => {
                report(broker.unbind(exchange, queue, pattern));
            }
            ["publish", exchange, key, payload @ ..] => {
                match broker.publish(exchange, key, payload.join(" ")) {
                    Ok(n) => println!("routed to {n} queue(s)"),
                    Err(e) => println!("error: {e}"),
                }
            }
            ["send", queue, payload @ ..] => {
                // Work-queue mode: the default exchange routes straight to
                // the queue named by the key.
                match broker.publish("", queue, payload.join(" ")) {
                    Ok(n) => println!("routed to {n} queue(s)"),
                    Err(e) => println!("error: {e}"),
                }
            }
            ["consume", queue] => match broker.try_consume(queue, AckMode::Auto) {
                Ok(delivery) => {
                    println!("{}", String::from_utf8_lossy(&delivery.message.payload))
                }
                Err(BrokerError::Empty) => println!("(empty)"),
                Err(e) => println!("error: {e}"),
            },
            ["listen", queue] => {
                if listener.is_some() {
                    println!("already listening, `stop` first");
                    continue;
                }
                match Dispatcher::new(Arc::clone(&broker))
                    .register(queue, Arc::new(PrintHandler))
                    .start()
                {
                    Ok(handle) => {
                        listener = Some(handle);
                        println!("listening on {queue}, `stop` to end");
                    }
                    Err(e) => println!("error: {e}"),
                }
            }
            ["stop"] => match listener.take() {
                Some(handle) => {
                    handle.shutdown().await;
                    println!("stopped");
                }
                None => println!("not listening"),
            },
            ["depth", queue] => {
                match (broker.queue_depth(queue), broker.unacked(queue)) {
                    (Ok(depth), Ok(unacked)) => {
                        println!("{depth} pending, {unacked} unacked")
                    }
                    (Err(e), _) | (_, Err(e)) => println!("error: {e}"),
                }
            }
            ["stats"] => match serde_json::to_string_pretty(&broker.stats()) {
                Ok(stats) => println!("{stats}"),
                Err(e) => println!("error: {e}"),
            },
            _ => println!("unknown command, type `help`"),
        }
    }
    if let Some(handle) = listener.take() {
        handle.shutdown().await;
    }
}

fn report(result: Result<(), BrokerError>) {
    match result {
        Ok(()) => println!("ok"),
        Err(e) => println!("error: {e}"),
    }
}

fn print_help() {
    println!("commands:");
    println!("  declare-exchange <name> <direct|fanout|topic>");
    println!("  declare-queue <name> [max-length]");
    println!("  bind <exchange> <queue> <pattern>");
    println!("  unbind <exchange> <queue> <pattern>");
    println!("  publish <exchange> <routing-key> [payload..]");
    println!("  send <queue> [payload..]        (default exchange)");
    println!("  consume <queue>                 (non-blocking, auto-ack)");
    println!("  listen <queue> / stop           (handler-driven consumption)");
    println!("  depth <queue>");
    println!("  stats");
    println!("  quit");
}
