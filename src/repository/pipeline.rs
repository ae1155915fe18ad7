//! A bounded-concurrency pipelined writer for bulk reference-data loads.
//!
//! Commands arrive on a bounded channel as `(command, result sink)` pairs.
//! A fixed number of workers each hold one connection, buffer commands into
//! a Redis pipeline, and flush when the buffer reaches `flush_after` or the
//! input channel drains. Responses come back in submission order per
//! connection and are forwarded to each command's sink. An
//! exit-immediately signal makes every worker stop with a distinguishable
//! cancellation error.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Mutex};

use super::StoreError;

pub struct RedisCommand {
    pub cmd: redis::Cmd,
    pub result: oneshot::Sender<Result<redis::Value, StoreError>>,
}

impl RedisCommand {
    /// Builds a `SET key value` command. The caller may drop the returned
    /// receiver when it has no interest in the response.
    pub fn set(key: &str, value: &str) -> (Self, oneshot::Receiver<Result<redis::Value, StoreError>>) {
        let (tx, rx) = oneshot::channel();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        (RedisCommand { cmd, result: tx }, rx)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("pipeline cancelled")]
    Cancelled,
    #[error("{0} pipeline worker(s) failed: see previous log output")]
    Workers(usize),
}

pub struct RedisPipeline {
    pub flush_after: usize,
    pub max_active: usize,
    pub client: redis::Client,
}

impl RedisPipeline {
    /// Runs `max_active` workers until the command channel closes or the
    /// exit signal fires. Dropping the watch sender is equivalent to
    /// signalling it.
    pub async fn run(
        &self,
        exit: watch::Receiver<bool>,
        receive: mpsc::Receiver<RedisCommand>,
    ) -> Result<(), PipelineError> {
        let receive = Arc::new(Mutex::new(receive));

        let mut handles = Vec::with_capacity(self.max_active);
        for _ in 0..self.max_active {
            let client = self.client.clone();
            let receive = Arc::clone(&receive);
            let exit = exit.clone();
            let flush_after = self.flush_after;
            handles.push(tokio::spawn(worker(client, flush_after, exit, receive)));
        }

        let mut failed = 0usize;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::error!("pipeline worker failed: {e}");
                    failed += 1;
                }
                Err(e) => {
                    log::error!("pipeline worker panicked: {e}");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(PipelineError::Workers(failed));
        }
        Ok(())
    }
}

async fn worker(
    client: redis::Client,
    flush_after: usize,
    mut exit: watch::Receiver<bool>,
    receive: Arc<Mutex<mpsc::Receiver<RedisCommand>>>,
) -> Result<(), PipelineError> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    let mut pipe = redis::pipe();
    let mut pending: Vec<oneshot::Sender<Result<redis::Value, StoreError>>> =
        Vec::with_capacity(flush_after);

    loop {
        let next = tokio::select! {
            _ = exit.changed() => return Err(PipelineError::Cancelled),
            command = async { receive.lock().await.recv().await } => command,
        };

        match next {
            Some(command) => {
                pipe.add_command(command.cmd);
                pending.push(command.result);

                if pending.len() >= flush_after {
                    flush(&mut conn, &mut pipe, &mut pending).await?;
                }
            }
            None => {
                flush(&mut conn, &mut pipe, &mut pending).await?;
                return Ok(());
            }
        }
    }
}

async fn flush(
    conn: &mut redis::aio::MultiplexedConnection,
    pipe: &mut redis::Pipeline,
    pending: &mut Vec<oneshot::Sender<Result<redis::Value, StoreError>>>,
) -> Result<(), PipelineError> {
    if pending.is_empty() {
        return Ok(());
    }

    let values: Vec<redis::Value> = pipe.query_async(conn).await?;
    *pipe = redis::pipe();

    for (sink, value) in pending.drain(..).zip(values) {
        // The sink may have been dropped by a caller with no interest in
        // the response.
        let _ = sink.send(Ok(value));
    }

    Ok(())
}
