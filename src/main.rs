use chordfs::{bind, Config, Mode, Node};
use clap::Parser;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // init logger
    tracing_subscriber::fmt::init();

    let config = Config::parse();
    std::process::exit(run(config).await);
}

async fn run(config: Config) -> i32 {
    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        return 2;
    }

    let node = match Node::new(&config).await {
        Ok(node) => node,
        Err(e) => {
            error!("startup failed: {e}");
            return 2;
        }
    };

    let listener = match bind(config.port).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("{e}");
            return 3;
        }
    };
    info!(
        "listening on port {}, identifier {}",
        config.port,
        node.info().identifier
    );

    match config.mode {
        Mode::Create => {
            node.create().await;
            info!("created a new ring");
        }
        Mode::Join => {
            // validate() guarantees both are present in join mode
            let (Some(host), Some(port)) = (config.join_host.clone(), config.join_port) else {
                error!("join mode requires --join-host and --join-port");
                return 2;
            };
            if let Err(e) = node.join(&host, port).await {
                error!("joining via {host}:{port} failed: {e}");
                return 4;
            }
            info!("joined the ring via {host}:{port}");
        }
    }

    let handles = node.start(listener);

    let mut shutdown = node.shutdown_signal();
    let collapsed = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("leaving the ring");
            node.leave().await;
            false
        }
        // stabilize signals shutdown itself when the ring collapsed
        _ = shutdown.wait_for(|stop| *stop) => true,
    };

    for handle in handles {
        let _ = handle.await;
    }

    if collapsed {
        1
    } else {
        0
    }
}
