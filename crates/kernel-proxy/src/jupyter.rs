//! Jupyter-backed [`KernelService`] built on `runtimelib`.
//!
//! A launched kernel keeps one iopub subscription for its whole life, opened
//! before the first request so nothing the kernel publishes is missed. A
//! reader task forwards every iopub message into a channel; each `run` sends
//! `execute_request` on the persistent shell connection and reads that
//! channel until the kernel reports idle for its `msg_id`. A tokio mutex
//! around that exchange keeps at most one execution in flight. Restart and
//! shutdown bump a generation counter; any `run` waiting on the lock or on
//! iopub observes the bump and resolves as [`KernelError::Cancelled`].

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use futures::future::BoxFuture;
use jupyter_protocol::{
    ConnectionInfo, ExecuteRequest, ExecutionState, InterruptRequest, JupyterMessage,
    JupyterMessageContent, KernelInfoRequest, ShutdownRequest,
};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::content::{flatten_to_strings, message_content_to_nbformat};
use crate::{ExecuteReply, KernelDescription, KernelError, KernelService};

/// How to launch and talk to a kernel.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Kernelspec name, e.g. `python3`.
    pub kernel_name: String,
    /// Working directory for the kernel process (defaults to ours).
    pub working_dir: Option<PathBuf>,
    /// How long to wait for `kernel_info_reply` after launch.
    pub startup_timeout: Duration,
    /// Upper bound on a single execution; `None` waits forever.
    pub execution_timeout: Option<Duration>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            kernel_name: "python3".to_string(),
            working_dir: None,
            startup_timeout: Duration::from_secs(30),
            execution_timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// Live connection to a launched kernel process.
struct Connection {
    connection_info: ConnectionInfo,
    connection_file: PathBuf,
    session_id: String,
    shell_writer: runtimelib::DealerSendConnection,
    /// Every iopub message since launch, in publish order.
    iopub: mpsc::UnboundedReceiver<JupyterMessage>,
    iopub_task: JoinHandle<()>,
    shell_reader_task: JoinHandle<()>,
    _process: tokio::process::Child,
}

impl Connection {
    /// Send one execute_request and collect its outputs until the kernel is
    /// idle.
    async fn execute(&mut self, source: &str) -> anyhow::Result<ExecuteReply> {
        // Leftovers from earlier requests, including abandoned ones.
        while self.iopub.try_recv().is_ok() {}

        let message: JupyterMessage = ExecuteRequest::new(source.to_string()).into();
        let msg_id = message.header.msg_id.clone();
        self.shell_writer.send(message).await?;
        info!("[kernel] Sent execute_request: msg_id={}", msg_id);

        collect_reply(&mut self.iopub, &msg_id).await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.iopub_task.abort();
        self.shell_reader_task.abort();
    }
}

pub struct JupyterKernel {
    config: KernelConfig,
    /// Holding this lock means owning the single in-flight execution.
    exec_lock: Mutex<()>,
    connection: StdMutex<Option<(ConnectionInfo, String)>>,
    process: Mutex<Option<Connection>>,
    generation: watch::Sender<u64>,
    description: StdMutex<KernelDescription>,
}

impl JupyterKernel {
    /// Launch a kernel and wait for it to answer `kernel_info_request`.
    pub async fn start(config: KernelConfig) -> Result<Self, KernelError> {
        let (connection, description) = launch(&config).await?;
        let (generation, _) = watch::channel(0);
        Ok(Self {
            exec_lock: Mutex::new(()),
            connection: StdMutex::new(Some((
                connection.connection_info.clone(),
                connection.session_id.clone(),
            ))),
            process: Mutex::new(Some(connection)),
            generation,
            description: StdMutex::new(description),
            config,
        })
    }

    pub fn is_running(&self) -> bool {
        self.connection
            .lock()
            .map(|c| c.is_some())
            .unwrap_or(false)
    }

    fn connection_snapshot(&self) -> Result<(ConnectionInfo, String), KernelError> {
        self.connection
            .lock()
            .ok()
            .and_then(|c| c.clone())
            .ok_or_else(|| KernelError::Unavailable("No kernel running".to_string()))
    }

    fn bump_generation(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    async fn execute(&self, source: &str) -> Result<ExecuteReply, KernelError> {
        let mut cancelled = self.generation.subscribe();

        let _guard = tokio::select! {
            guard = self.exec_lock.lock() => guard,
            _ = cancelled.changed() => return Err(KernelError::Cancelled),
        };

        let mut process = self.process.lock().await;
        let connection = process
            .as_mut()
            .ok_or_else(|| KernelError::Unavailable("No kernel running".to_string()))?;
        let exchange = connection.execute(source);

        let timed = async {
            match self.config.execution_timeout {
                Some(limit) => match tokio::time::timeout(limit, exchange).await {
                    Ok(result) => result.map_err(KernelError::from),
                    Err(_) => Err(KernelError::Unavailable(format!(
                        "execution did not finish within {}s",
                        limit.as_secs()
                    ))),
                },
                None => exchange.await.map_err(KernelError::from),
            }
        };

        tokio::select! {
            result = timed => result,
            _ = cancelled.changed() => {
                warn!("[kernel] Execution cancelled by restart");
                Err(KernelError::Cancelled)
            }
        }
    }

    async fn send_interrupt(&self) -> Result<(), KernelError> {
        let (connection_info, session_id) = self.connection_snapshot()?;
        let mut control =
            runtimelib::create_client_control_connection(&connection_info, &session_id)
                .await
                .map_err(|e| KernelError::Unavailable(e.to_string()))?;
        let request: JupyterMessage = InterruptRequest {}.into();
        control
            .send(request)
            .await
            .map_err(|e| KernelError::Unavailable(e.to_string()))?;
        info!("[kernel] Sent interrupt_request");
        Ok(())
    }

    async fn stop(&self) -> Result<(), KernelError> {
        self.bump_generation();
        let taken = self.connection.lock().ok().and_then(|mut c| c.take());
        let mut process = self.process.lock().await;

        if let Some((connection_info, session_id)) = taken {
            match runtimelib::create_client_control_connection(&connection_info, &session_id)
                .await
            {
                Ok(mut control) => {
                    let request: JupyterMessage = ShutdownRequest { restart: false }.into();
                    control.send(request).await.ok();
                }
                Err(e) => warn!("[kernel] Could not open control channel: {}", e),
            }
        }

        if let Some(connection) = process.take() {
            tokio::fs::remove_file(&connection.connection_file).await.ok();
        }
        Ok(())
    }

    async fn relaunch(&self) -> Result<(), KernelError> {
        self.stop().await?;
        // Wait for any cancelled run to release the execution lock.
        let _guard = self.exec_lock.lock().await;

        let (connection, description) = launch(&self.config).await?;
        if let Ok(mut c) = self.connection.lock() {
            *c = Some((
                connection.connection_info.clone(),
                connection.session_id.clone(),
            ));
        }
        if let Ok(mut d) = self.description.lock() {
            *d = description;
        }
        *self.process.lock().await = Some(connection);
        info!("[kernel] Kernel restarted");
        Ok(())
    }
}

impl KernelService for JupyterKernel {
    fn run<'a>(&'a self, source: &'a str) -> BoxFuture<'a, Result<ExecuteReply, KernelError>> {
        Box::pin(self.execute(source))
    }

    fn interrupt(&self) -> BoxFuture<'_, Result<(), KernelError>> {
        Box::pin(self.send_interrupt())
    }

    fn restart(&self) -> BoxFuture<'_, Result<(), KernelError>> {
        Box::pin(self.relaunch())
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<(), KernelError>> {
        Box::pin(self.stop())
    }

    fn describe(&self) -> KernelDescription {
        if !self.is_running() {
            return KernelDescription::default();
        }
        self.description
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    fn is_available(&self) -> bool {
        self.is_running()
    }
}

/// Read iopub until the kernel reports idle for `msg_id`. Messages for
/// other requests are skipped.
async fn collect_reply(
    iopub: &mut mpsc::UnboundedReceiver<JupyterMessage>,
    msg_id: &str,
) -> anyhow::Result<ExecuteReply> {
    let mut reply = ExecuteReply::default();
    while let Some(msg) = iopub.recv().await {
        let is_ours = msg.parent_header.as_ref().map(|h| h.msg_id.as_str()) == Some(msg_id);
        if !is_ours {
            continue;
        }
        match &msg.content {
            JupyterMessageContent::ExecuteInput(input) => {
                reply.execution_count = Some(input.execution_count.0 as i64);
            }
            JupyterMessageContent::Status(status) => {
                if status.execution_state == ExecutionState::Idle {
                    return Ok(reply);
                }
            }
            content => {
                if let Some(output) = message_content_to_nbformat(content) {
                    reply.outputs.push(output);
                }
            }
        }
    }
    Err(anyhow::anyhow!("iopub connection closed"))
}

async fn launch(config: &KernelConfig) -> anyhow::Result<(Connection, KernelDescription)> {
    let kernelspec = runtimelib::find_kernelspec(&config.kernel_name).await?;

    // Reserve ports
    let ip = std::net::IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
    let ports = runtimelib::peek_ports(ip, 5).await?;

    let connection_info = ConnectionInfo {
        transport: jupyter_protocol::connection_info::Transport::TCP,
        ip: ip.to_string(),
        stdin_port: ports[0],
        control_port: ports[1],
        hb_port: ports[2],
        shell_port: ports[3],
        iopub_port: ports[4],
        signature_scheme: "hmac-sha256".to_string(),
        key: Uuid::new_v4().to_string(),
        kernel_name: Some(config.kernel_name.clone()),
    };

    let runtime_dir = runtimelib::dirs::runtime_dir();
    tokio::fs::create_dir_all(&runtime_dir).await?;

    let kernel_id: String =
        petname::petname(2, "-").unwrap_or_else(|| Uuid::new_v4().to_string());
    let connection_file = runtime_dir.join(format!("terminal-notebook-kernel-{}.json", kernel_id));

    tokio::fs::write(
        &connection_file,
        serde_json::to_string_pretty(&connection_info)?,
    )
    .await?;

    info!(
        "[kernel] Starting {} kernel at {:?}",
        config.kernel_name, connection_file
    );

    let mut cmd = kernelspec.clone().command(&connection_file, Some(Stdio::null()), Some(Stdio::null()))?;
    if let Some(ref dir) = config.working_dir {
        cmd.current_dir(dir);
    }
    let process = cmd.kill_on_drop(true).spawn()?;

    // Small delay to let the kernel start
    tokio::time::sleep(Duration::from_millis(500)).await;

    let session_id = Uuid::new_v4().to_string();

    // Create iopub connection and spawn listener
    let mut iopub =
        runtimelib::create_client_iopub_connection(&connection_info, "", &session_id).await?;
    let (iopub_tx, iopub_rx) = mpsc::unbounded_channel::<JupyterMessage>();
    let iopub_task = tokio::spawn(async move {
        loop {
            match iopub.read().await {
                Ok(message) => {
                    debug!(
                        "[kernel] iopub: type={} parent_msg_id={:?}",
                        message.header.msg_type,
                        message.parent_header.as_ref().map(|h| &h.msg_id)
                    );
                    if iopub_tx.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("[kernel] iopub read error: {}", e);
                    break;
                }
            }
        }
    });

    let handshake = async {
        let identity = runtimelib::peer_identity_for_session(&session_id)?;
        let mut shell = runtimelib::create_client_shell_connection_with_identity(
            &connection_info,
            &session_id,
            identity,
        )
        .await?;

        let request: JupyterMessage = KernelInfoRequest::default().into();
        shell.send(request).await?;

        let language_info = match tokio::time::timeout(config.startup_timeout, shell.read()).await
        {
            Ok(Ok(msg)) => {
                info!("[kernel] Kernel alive: got {} reply", msg.header.msg_type);
                match msg.content {
                    JupyterMessageContent::KernelInfoReply(reply) => {
                        serde_json::to_value(&reply.language_info)
                            .map(|v| flatten_to_strings(&v))
                            .unwrap_or_default()
                    }
                    _ => BTreeMap::new(),
                }
            }
            Ok(Err(e)) => {
                error!("[kernel] Error reading kernel_info_reply: {}", e);
                return Err(anyhow::anyhow!("Kernel did not respond: {}", e));
            }
            Err(_) => {
                error!("[kernel] Timeout waiting for kernel_info_reply");
                return Err(anyhow::anyhow!(
                    "Kernel did not respond within {}s",
                    config.startup_timeout.as_secs()
                ));
            }
        };
        Ok::<_, anyhow::Error>((shell, language_info))
    };
    let (shell, language_info) = match handshake.await {
        Ok(handshake) => handshake,
        Err(e) => {
            iopub_task.abort();
            return Err(e);
        }
    };

    // Split shell into persistent writer + reader; replies are only logged,
    // completion is signalled on iopub.
    let (shell_writer, mut shell_reader) = shell.split();
    let shell_reader_task = tokio::spawn(async move {
        loop {
            match shell_reader.read().await {
                Ok(msg) => debug!("[kernel] shell reply: type={}", msg.header.msg_type),
                Err(e) => {
                    error!("[kernel] shell read error: {}", e);
                    break;
                }
            }
        }
    });

    let description = KernelDescription {
        kernel_info: BTreeMap::from([("name".to_string(), config.kernel_name.clone())]),
        kernel_spec: BTreeMap::from([
            (
                "display_name".to_string(),
                kernelspec.kernelspec.display_name.clone(),
            ),
            ("language".to_string(), kernelspec.kernelspec.language.clone()),
            ("name".to_string(), kernelspec.kernel_name.clone()),
        ]),
        language_info,
    };

    info!("[kernel] Kernel started: {}", kernel_id);
    Ok((
        Connection {
            connection_info,
            connection_file,
            session_id,
            shell_writer,
            iopub: iopub_rx,
            iopub_task,
            shell_reader_task,
            _process: process,
        },
        description,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jupyter_protocol::{ExecuteInput, ExecutionCount, Status, StreamContent};
    use serde_json::json;

    fn request(code: &str) -> JupyterMessage {
        ExecuteRequest::new(code.to_string()).into()
    }

    #[tokio::test]
    async fn test_collect_reply_sees_messages_published_before_reading() {
        let ours = request("print('hi')");
        let other = request("other");
        let (tx, mut rx) = mpsc::unbounded_channel();

        // A fast cell: everything, idle included, is already buffered.
        tx.send(Status::busy().as_child_of(&ours)).unwrap();
        tx.send(StreamContent::stdout("stale\n").as_child_of(&other)).unwrap();
        tx.send(
            ExecuteInput {
                code: "print('hi')".to_string(),
                execution_count: ExecutionCount::new(3),
            }
            .as_child_of(&ours),
        )
        .unwrap();
        tx.send(StreamContent::stdout("hi\n").as_child_of(&ours)).unwrap();
        tx.send(Status::idle().as_child_of(&ours)).unwrap();

        let reply = collect_reply(&mut rx, &ours.header.msg_id).await.unwrap();
        assert_eq!(reply.execution_count, Some(3));
        assert_eq!(
            reply.outputs,
            vec![json!({"output_type": "stream", "name": "stdout", "text": "hi\n"})]
        );
    }

    #[tokio::test]
    async fn test_collect_reply_ignores_idle_of_other_requests() {
        let ours = request("1 + 1");
        let other = request("2 + 2");
        let (tx, mut rx) = mpsc::unbounded_channel();

        tx.send(Status::idle().as_child_of(&other)).unwrap();
        tx.send(StreamContent::stdout("2\n").as_child_of(&ours)).unwrap();
        drop(tx);

        let err = collect_reply(&mut rx, &ours.header.msg_id).await.unwrap_err();
        assert!(err.to_string().contains("iopub connection closed"));
    }
}
