//! Scripted in-memory engine for tests.
//!
//! Units behave according to a [`UnitScript`] registered for their image
//! (exec sessions: for their command prefix). Every call is recorded so
//! tests can check create/remove pairing and call order.

use super::{ByteStream, Engine, ExecId, ExecSpec, ExitResult, UnitId, VolumeId};
use crate::handoff::single_file_archive;
use crate::stage::LaunchSpec;
use crate::stream::{OutputFrame, Sink, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use stagehand_shared::{StagehandError, StagehandResult};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;

type Responder = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// How a scripted unit or exec session behaves.
#[derive(Clone, Default)]
pub(crate) struct UnitScript {
    exit_code: i64,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    files: BTreeMap<String, Vec<u8>>,
    respond: Option<Responder>,
    hang: bool,
    stream_error: Option<String>,
    still_running: bool,
    fail_start: Option<String>,
}

impl UnitScript {
    pub(crate) fn exit(code: i64) -> Self {
        Self {
            exit_code: code,
            ..Default::default()
        }
    }

    pub(crate) fn stdout(mut self, data: impl AsRef<[u8]>) -> Self {
        self.stdout.extend_from_slice(data.as_ref());
        self
    }

    pub(crate) fn stderr(mut self, data: impl AsRef<[u8]>) -> Self {
        self.stderr.extend_from_slice(data.as_ref());
        self
    }

    /// A file that `copy_from` can fetch after the unit ran.
    pub(crate) fn file(mut self, path: &str, contents: impl AsRef<[u8]>) -> Self {
        self.files
            .insert(path.to_string(), contents.as_ref().to_vec());
        self
    }

    /// Read stdin to EOF, then append the responder's reply to stdout.
    pub(crate) fn respond<F>(mut self, respond: F) -> Self
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        self.respond = Some(Arc::new(respond));
        self
    }

    /// Never close the output stream.
    pub(crate) fn hang(mut self) -> Self {
        self.hang = true;
        self
    }

    pub(crate) fn stream_error(mut self, message: &str) -> Self {
        self.stream_error = Some(message.to_string());
        self
    }

    pub(crate) fn still_running(mut self) -> Self {
        self.still_running = true;
        self
    }

    pub(crate) fn fail_start(mut self, message: &str) -> Self {
        self.fail_start = Some(message.to_string());
        self
    }
}

struct FakeUnit {
    image: String,
    prefix: String,
    script: UnitScript,
    started: Arc<Notify>,
}

struct FakeExec {
    script: UnitScript,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    units: HashMap<UnitId, FakeUnit>,
    execs: HashMap<ExecId, FakeExec>,
    scripts: HashMap<String, UnitScript>,
    exec_scripts: Vec<(Vec<String>, UnitScript)>,

    launches: Vec<LaunchSpec>,
    created_units: usize,
    started_units: usize,
    stopped_units: usize,
    removed_units: usize,
    created_volumes: Vec<VolumeId>,
    removed_volumes: Vec<VolumeId>,
    exec_commands: Vec<ExecSpec>,
    copied_in: Vec<(String, Bytes)>,
    copied_out: Vec<String>,
    stdin: HashMap<String, Vec<u8>>,
    events: Vec<String>,

    missing_images: HashSet<String>,
    image_lookup_error: Option<String>,
    pull_errors: HashMap<String, String>,
    pulled: Vec<String>,
    digests: HashMap<String, Vec<String>>,
    fail_remove_unit: Option<String>,
    fail_create_volume: Option<String>,
    fail_remove_volume: Option<String>,
}

impl FakeState {
    fn next_id(&mut self, kind: &str) -> String {
        self.next_id += 1;
        format!("{}{:060}", kind, self.next_id)
    }

    fn unit(&self, id: &UnitId) -> StagehandResult<&FakeUnit> {
        self.units
            .get(id)
            .ok_or_else(|| StagehandError::Engine(format!("No such container: {}", id)))
    }

    fn exec_script(&self, command: &[String]) -> UnitScript {
        self.exec_scripts
            .iter()
            .filter(|(prefix, _)| command.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, script)| script.clone())
            .unwrap_or_default()
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeEngine {
    state: Arc<Mutex<FakeState>>,
}

impl FakeEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Behaviour of every unit created from `image`.
    pub(crate) fn script(&self, image: &str, script: UnitScript) {
        self.state.lock().scripts.insert(image.to_string(), script);
    }

    /// Behaviour of exec sessions whose command starts with `prefix`.
    /// The longest matching prefix wins.
    pub(crate) fn script_exec(&self, prefix: &[&str], script: UnitScript) {
        let prefix = prefix.iter().map(|s| s.to_string()).collect();
        self.state.lock().exec_scripts.push((prefix, script));
    }

    pub(crate) fn mark_missing(&self, image: &str) {
        self.state.lock().missing_images.insert(image.to_string());
    }

    pub(crate) fn fail_image_lookup(&self, message: &str) {
        self.state.lock().image_lookup_error = Some(message.to_string());
    }

    /// Pulling `image` fails with an engine error.
    pub(crate) fn fail_pull(&self, image: &str, message: &str) {
        self.state
            .lock()
            .pull_errors
            .insert(image.to_string(), message.to_string());
    }

    pub(crate) fn set_digests(&self, image: &str, digests: &[&str]) {
        self.state.lock().digests.insert(
            image.to_string(),
            digests.iter().map(|d| d.to_string()).collect(),
        );
    }

    pub(crate) fn fail_remove_unit(&self, message: &str) {
        self.state.lock().fail_remove_unit = Some(message.to_string());
    }

    pub(crate) fn fail_create_volume(&self, message: &str) {
        self.state.lock().fail_create_volume = Some(message.to_string());
    }

    pub(crate) fn fail_remove_volume(&self, message: &str) {
        self.state.lock().fail_remove_volume = Some(message.to_string());
    }

    pub(crate) fn pulled(&self) -> Vec<String> {
        self.state.lock().pulled.clone()
    }

    pub(crate) fn launches(&self) -> Vec<LaunchSpec> {
        self.state.lock().launches.clone()
    }

    /// Launch specs of units whose name prefix is `prefix`.
    pub(crate) fn launches_of(&self, prefix: &str) -> Vec<LaunchSpec> {
        self.launches()
            .into_iter()
            .filter(|spec| spec.name_prefix == prefix)
            .collect()
    }

    pub(crate) fn created_units(&self) -> usize {
        self.state.lock().created_units
    }

    pub(crate) fn started_units(&self) -> usize {
        self.state.lock().started_units
    }

    pub(crate) fn stopped_units(&self) -> usize {
        self.state.lock().stopped_units
    }

    pub(crate) fn removed_units(&self) -> usize {
        self.state.lock().removed_units
    }

    pub(crate) fn live_units(&self) -> usize {
        self.state.lock().units.len()
    }

    pub(crate) fn created_volumes(&self) -> Vec<VolumeId> {
        self.state.lock().created_volumes.clone()
    }

    /// Every removal attempt, failed ones included.
    pub(crate) fn removed_volumes(&self) -> Vec<VolumeId> {
        self.state.lock().removed_volumes.clone()
    }

    pub(crate) fn exec_commands(&self) -> Vec<Vec<String>> {
        self.state
            .lock()
            .exec_commands
            .iter()
            .map(|spec| spec.command.clone())
            .collect()
    }

    pub(crate) fn exec_specs(&self) -> Vec<ExecSpec> {
        self.state.lock().exec_commands.clone()
    }

    pub(crate) fn copied_out(&self) -> Vec<String> {
        self.state.lock().copied_out.clone()
    }

    /// Files copied into units as `(dir, name, contents)`.
    pub(crate) fn copied_files(&self) -> Vec<(String, String, Vec<u8>)> {
        let copied = self.state.lock().copied_in.clone();
        let mut files = Vec::new();
        for (dir, archive) in copied {
            let mut archive = tar::Archive::new(archive.as_ref());
            for entry in archive.entries().expect("valid archive") {
                let mut entry = entry.expect("valid entry");
                let name = entry
                    .path()
                    .expect("entry path")
                    .to_string_lossy()
                    .into_owned();
                let mut contents = Vec::new();
                entry.read_to_end(&mut contents).expect("entry contents");
                files.push((dir.clone(), name, contents));
            }
        }
        files
    }

    /// Everything written to the stdin of units created from `image`.
    pub(crate) fn stdin_of(&self, image: &str) -> Vec<u8> {
        self.state
            .lock()
            .stdin
            .get(image)
            .cloned()
            .unwrap_or_default()
    }

    /// Ordered log of lifecycle calls, e.g. `create stagehand-config`.
    pub(crate) fn events(&self) -> Vec<String> {
        self.state.lock().events.clone()
    }

    fn record(&self, event: String) {
        self.state.lock().events.push(event);
    }
}

/// Output of one scripted run, gated on `gate` when given.
fn scripted_output(
    state: Arc<Mutex<FakeState>>,
    image: String,
    script: UnitScript,
    gate: Option<Arc<Notify>>,
    stdin: Option<DuplexStream>,
) -> BoxStream<'static, StagehandResult<OutputFrame>> {
    async_stream::stream! {
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if script.hang {
            futures::future::pending::<()>().await;
        }

        let mut stdout = script.stdout.clone();
        if let Some(mut stdin) = stdin {
            let mut received = Vec::new();
            if let Err(e) = stdin.read_to_end(&mut received).await {
                yield Err(StagehandError::from(e));
                return;
            }
            if let Some(respond) = &script.respond {
                stdout.extend(respond(&received));
            }
            state.lock().stdin.entry(image).or_default().extend(received);
        }

        if !script.stderr.is_empty() {
            yield Ok(OutputFrame::Stderr(Bytes::from(script.stderr.clone())));
        }
        if !stdout.is_empty() {
            yield Ok(OutputFrame::Stdout(Bytes::from(stdout)));
        }
        if let Some(message) = script.stream_error {
            yield Err(StagehandError::Stream(message));
        }
    }
    .boxed()
}

#[async_trait]
impl Engine for FakeEngine {
    async fn create_unit(&self, spec: &LaunchSpec, _attach_stdin: bool) -> StagehandResult<UnitId> {
        let mut state = self.state.lock();
        let id = UnitId::new(state.next_id("u"));
        let script = state.scripts.get(&spec.image).cloned().unwrap_or_default();
        state.units.insert(
            id.clone(),
            FakeUnit {
                image: spec.image.clone(),
                prefix: spec.name_prefix.clone(),
                script,
                started: Arc::new(Notify::new()),
            },
        );
        state.launches.push(spec.clone());
        state.created_units += 1;
        state.events.push(format!("create {}", spec.name_prefix));
        Ok(id)
    }

    async fn attach(&self, unit: &UnitId, stdin: bool) -> StagehandResult<Transport> {
        let (image, script, gate) = {
            let state = self.state.lock();
            let unit = state.unit(unit)?;
            (
                unit.image.clone(),
                unit.script.clone(),
                Arc::clone(&unit.started),
            )
        };

        let (writer, reader) = tokio::io::duplex(64 * 1024);
        let reader = stdin.then_some(reader);
        let output = scripted_output(Arc::clone(&self.state), image, script, Some(gate), reader);
        Ok(Transport::new(output, Box::pin(writer)))
    }

    async fn start(&self, unit: &UnitId) -> StagehandResult<()> {
        let mut state = self.state.lock();
        let (prefix, failure, gate) = {
            let unit = state.unit(unit)?;
            (
                unit.prefix.clone(),
                unit.script.fail_start.clone(),
                Arc::clone(&unit.started),
            )
        };
        state.events.push(format!("start {}", prefix));
        if let Some(message) = failure {
            return Err(StagehandError::Engine(message));
        }
        state.started_units += 1;
        gate.notify_one();
        Ok(())
    }

    async fn inspect(&self, unit: &UnitId) -> StagehandResult<ExitResult> {
        let state = self.state.lock();
        let unit = state.unit(unit)?;
        Ok(ExitResult {
            exit_code: unit.script.exit_code,
            running: unit.script.still_running,
        })
    }

    async fn stop(&self, unit: &UnitId, _timeout: Duration) -> StagehandResult<()> {
        let mut state = self.state.lock();
        let prefix = state.unit(unit)?.prefix.clone();
        state.stopped_units += 1;
        state.events.push(format!("stop {}", prefix));
        Ok(())
    }

    async fn remove(&self, unit: &UnitId) -> StagehandResult<()> {
        let mut state = self.state.lock();
        if let Some(message) = state.fail_remove_unit.clone() {
            return Err(StagehandError::Engine(message));
        }
        let removed = state
            .units
            .remove(unit)
            .ok_or_else(|| StagehandError::Engine(format!("No such container: {}", unit)))?;
        state.removed_units += 1;
        state.events.push(format!("remove {}", removed.prefix));
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> StagehandResult<bool> {
        let state = self.state.lock();
        if let Some(message) = &state.image_lookup_error {
            return Err(StagehandError::Engine(message.clone()));
        }
        Ok(!state.missing_images.contains(image))
    }

    async fn pull(&self, image: &str, progress: &mut Sink) -> StagehandResult<()> {
        {
            let mut state = self.state.lock();
            if let Some(message) = state.pull_errors.get(image) {
                return Err(StagehandError::Engine(message.clone()));
            }
            state.missing_images.remove(image);
            state.pulled.push(image.to_string());
        }
        progress
            .write_all(format!("pulled {}\n", image).as_bytes())
            .await?;
        Ok(())
    }

    async fn image_digests(&self, image: &str) -> StagehandResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .digests
            .get(image)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_volume(&self) -> StagehandResult<VolumeId> {
        let mut state = self.state.lock();
        if let Some(message) = state.fail_create_volume.clone() {
            return Err(StagehandError::Engine(message));
        }
        let id = VolumeId::new(state.next_id("v"));
        state.created_volumes.push(id.clone());
        state.events.push("create volume".to_string());
        Ok(id)
    }

    async fn remove_volume(&self, volume: &VolumeId) -> StagehandResult<()> {
        let mut state = self.state.lock();
        state.removed_volumes.push(volume.clone());
        state.events.push("remove volume".to_string());
        match state.fail_remove_volume.clone() {
            Some(message) => Err(StagehandError::Engine(message)),
            None => Ok(()),
        }
    }

    async fn copy_from(&self, unit: &UnitId, path: &str) -> StagehandResult<ByteStream> {
        let contents = {
            let mut state = self.state.lock();
            let contents = state.unit(unit)?.script.files.get(path).cloned();
            state.copied_out.push(path.to_string());
            contents.ok_or_else(|| {
                StagehandError::Engine(format!("Could not find the file {} in container", path))
            })?
        };

        let name = path.rsplit('/').next().unwrap_or(path);
        let archive = single_file_archive(name, &contents)?;
        // Two chunks, like a real streamed response.
        let mid = archive.len() / 2;
        let chunks = vec![Ok(archive.slice(..mid)), Ok(archive.slice(mid..))];
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn copy_to(&self, unit: &UnitId, dir: &str, archive: Bytes) -> StagehandResult<()> {
        let mut state = self.state.lock();
        let prefix = state.unit(unit)?.prefix.clone();
        state.copied_in.push((dir.to_string(), archive));
        state.events.push(format!("copy {} {}", prefix, dir));
        Ok(())
    }

    async fn create_exec(&self, unit: &UnitId, spec: &ExecSpec) -> StagehandResult<ExecId> {
        let mut state = self.state.lock();
        state.unit(unit)?;
        let id = ExecId::new(state.next_id("e"));
        let script = state.exec_script(&spec.command);
        state.execs.insert(id.clone(), FakeExec { script });
        state.exec_commands.push(spec.clone());
        state.events.push(format!("exec {}", spec.command.join(" ")));
        Ok(id)
    }

    async fn start_exec(&self, exec: &ExecId) -> StagehandResult<Transport> {
        let script = {
            let state = self.state.lock();
            state
                .execs
                .get(exec)
                .map(|exec| exec.script.clone())
                .ok_or_else(|| StagehandError::Engine(format!("No such exec: {}", exec)))?
        };
        let output = scripted_output(Arc::clone(&self.state), String::new(), script, None, None);
        Ok(Transport::new(output, Box::pin(tokio::io::sink())))
    }

    async fn inspect_exec(&self, exec: &ExecId) -> StagehandResult<ExitResult> {
        let state = self.state.lock();
        let exec = state
            .execs
            .get(exec)
            .ok_or_else(|| StagehandError::Engine(format!("No such exec: {}", exec)))?;
        Ok(ExitResult {
            exit_code: exec.script.exit_code,
            running: exec.script.still_running,
        })
    }
}
