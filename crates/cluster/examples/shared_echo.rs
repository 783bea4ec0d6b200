// Fork a pair of workers that all accept on one shared TCP socket.
//
//   cargo run --example shared_echo
//
// The same binary serves both roles: the process started by hand is the
// supervisor, and the processes it forks detect the worker role from
// their environment. Every connection to 127.0.0.1:7070 is echoed back
// by whichever worker the kernel hands it to. Ctrl-C drains the cluster.

use anyhow::Result;
use cluster::{AgentEvent, ClusterEvent, Role, Supervisor, WorkerAgent};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match cluster::role() {
        Role::Supervisor => run_supervisor().await,
        Role::Worker { .. } => run_worker().await,
    }
}

async fn run_supervisor() -> Result<()> {
    let supervisor = Supervisor::new();
    let mut events = supervisor.events();
    for _ in 0..2 {
        supervisor.fork(Vec::new())?;
    }

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ClusterEvent::Listening { worker, address } => {
                    tracing::info!("worker {} accepting on {}", worker, address);
                }
                ClusterEvent::Exit { worker, code, signal, suicide } => {
                    tracing::info!(
                        "worker {} exited (code={:?}, signal={:?}, suicide={})",
                        worker,
                        code,
                        signal,
                        suicide
                    );
                }
                _ => {}
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("draining cluster");
    supervisor.disconnect().await;
    Ok(())
}

async fn run_worker() -> Result<()> {
    let agent = WorkerAgent::connect()?;
    let mut events = agent.events();
    let server = agent.listen(("127.0.0.1", 7070)).await?;

    let acceptor = server.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _peer)) = acceptor.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    loop {
        match events.recv().await {
            Ok(AgentEvent::Disconnect) | Err(_) => return Ok(()),
            Ok(_) => {}
        }
    }
}
