//! In-memory cluster for unit tests.
//!
//! Interprets the commands produced by [`super::shell`] against an in-memory
//! file tree, lets tests script scheduler output and inject copy failures or
//! digest mismatches, and records every call in order.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::shell::{self, glob_match};
use super::{CommandResult, RemoteChannel};
use crate::types::{StageError, StageResult};

#[derive(Debug, Clone)]
pub enum Scripted {
    Output { exit_code: i32, stdout: String },
    ChannelError(String),
}

#[derive(Default)]
struct FakeState {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    archives: HashMap<String, Vec<(String, Vec<u8>)>>,
    copy_failures: HashMap<String, u32>,
    digest_corruptions: HashMap<String, u32>,
    refused_dirs: BTreeSet<String>,
    scripted: Vec<(String, VecDeque<Scripted>)>,
    dropped: Vec<(String, u32)>,
    effects: Vec<(String, String, Vec<u8>)>,
    history: Vec<String>,
}

#[derive(Default)]
pub struct FakeChannel {
    state: Mutex<FakeState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    copy_latency_ms: u64,
}

impl FakeChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies take this long, so concurrent transfers overlap
    pub fn with_copy_latency(mut self, millis: u64) -> Self {
        self.copy_latency_ms = millis;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn put_file(&self, path: &str, content: &[u8]) {
        let mut state = self.state();
        add_dir(&mut state, &shell::parent(path));
        state.files.insert(path.to_string(), content.to_vec());
    }

    pub fn put_dir(&self, path: &str) {
        add_dir(&mut self.state(), path);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        dir_exists(&self.state(), path)
    }

    pub fn files_under(&self, dir: &str) -> Vec<String> {
        files_under(&self.state(), dir)
            .into_iter()
            .map(|(path, _)| path)
            .collect()
    }

    /// The next `times` copies touching `remote` fail
    pub fn fail_copies(&self, remote: &str, times: u32) {
        self.state().copy_failures.insert(remote.to_string(), times);
    }

    /// The next `times` digest queries for `remote` report a wrong checksum
    pub fn corrupt_digest(&self, remote: &str, times: u32) {
        self.state()
            .digest_corruptions
            .insert(remote.to_string(), times);
    }

    /// `mkdir -p` reports success without creating the directory
    pub fn refuse_dir(&self, path: &str) {
        self.state().refused_dirs.insert(path.to_string());
    }

    /// Answer commands starting with `prefix`; the last scripted answer repeats
    pub fn script(&self, prefix: &str, exit_code: i32, stdout: &str) {
        self.push_script(
            prefix,
            Scripted::Output {
                exit_code,
                stdout: stdout.to_string(),
            },
        );
    }

    pub fn script_channel_error(&self, prefix: &str, message: &str) {
        self.push_script(prefix, Scripted::ChannelError(message.to_string()));
    }

    /// The next `times` commands starting with `prefix` lose the session
    pub fn drop_connection(&self, prefix: &str, times: u32) {
        self.state().dropped.push((prefix.to_string(), times));
    }

    /// Every command starting with `prefix` also writes `path`, the way the
    /// driver script writes its log on the cluster
    pub fn on_command(&self, prefix: &str, path: &str, content: &[u8]) {
        self.state()
            .effects
            .push((prefix.to_string(), path.to_string(), content.to_vec()));
    }

    fn push_script(&self, prefix: &str, answer: Scripted) {
        let mut state = self.state();
        match state.scripted.iter_mut().find(|(p, _)| p == prefix) {
            Some((_, queue)) => queue.push_back(answer),
            None => state
                .scripted
                .push((prefix.to_string(), VecDeque::from([answer]))),
        }
    }

    pub fn history(&self) -> Vec<String> {
        self.state().history.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter_copy(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if self.copy_latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.copy_latency_ms)).await;
        }
    }

    fn leave_copy(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn take_failure(state: &mut FakeState, remote: &str) -> bool {
        match state.copy_failures.get_mut(remote) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

fn add_dir(state: &mut FakeState, path: &str) {
    let mut current = path.trim_end_matches('/').to_string();
    while !current.is_empty() && current != "." && current != "/" {
        state.dirs.insert(current.clone());
        current = shell::parent(&current);
    }
}

fn dir_exists(state: &FakeState, path: &str) -> bool {
    let path = path.trim_end_matches('/');
    let prefix = format!("{path}/");
    state.dirs.contains(path) || state.files.keys().any(|f| f.starts_with(&prefix))
}

fn files_under(state: &FakeState, dir: &str) -> Vec<(String, Vec<u8>)> {
    let prefix = format!("{}/", dir.trim_end_matches('/'));
    state
        .files
        .iter()
        .filter(|(path, _)| path.starts_with(&prefix))
        .map(|(path, content)| (path.clone(), content.clone()))
        .collect()
}

fn remove_tree(state: &mut FakeState, path: &str) {
    let path = path.trim_end_matches('/').to_string();
    let prefix = format!("{path}/");
    state.files.retain(|f, _| f != &path && !f.starts_with(&prefix));
    state.dirs.retain(|d| d != &path && !d.starts_with(&prefix));
}

fn output(exit_code: i32, stdout: String) -> (i32, String) {
    (exit_code, stdout)
}

fn run_builtin(state: &mut FakeState, words: &[String]) -> (i32, String) {
    let args: Vec<&str> = words.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["mkdir", "-p", dirs @ ..] => {
            for dir in dirs {
                if !state.refused_dirs.contains(*dir) {
                    add_dir(state, dir);
                }
            }
            output(0, String::new())
        }
        ["test", "-d", dir] => output(if dir_exists(state, dir) { 0 } else { 1 }, String::new()),
        ["test", "-e", path] => output(
            if state.files.contains_key(*path) || dir_exists(state, path) { 0 } else { 1 },
            String::new(),
        ),
        ["test", "-f", file] => output(
            if state.files.contains_key(*file) { 0 } else { 1 },
            String::new(),
        ),
        ["sha256sum", file] => {
            let corrupt = match state.digest_corruptions.get_mut(*file) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            };
            match state.files.get(*file) {
                Some(content) => {
                    let bytes: &[u8] = if corrupt { b"corrupted" } else { content };
                    output(0, format!("{}  {}\n", hex::encode(Sha256::digest(bytes)), file))
                }
                None => output(1, String::new()),
            }
        }
        ["ls", "-1", dir] => {
            if !dir_exists(state, dir) {
                return output(2, String::new());
            }
            let prefix = format!("{}/", dir.trim_end_matches('/'));
            let children: BTreeSet<String> = state
                .files
                .keys()
                .chain(state.dirs.iter())
                .filter_map(|p| p.strip_prefix(&prefix))
                .filter_map(|rest| rest.split('/').next())
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
            output(0, children.into_iter().map(|c| c + "\n").collect())
        }
        ["find", dir, "-mindepth", "1", "-maxdepth", "1", ..] => {
            let dir = dir.trim_end_matches('/').to_string();
            let prefix = format!("{dir}/");
            state.files.retain(|f, _| !f.starts_with(&prefix));
            state.dirs.retain(|d| !d.starts_with(&prefix));
            state.dirs.insert(dir);
            output(0, String::new())
        }
        ["find", dir, "-type", "f", rest @ ..] if rest.last() == Some(&"-delete") => {
            let keep: Vec<&str> = rest
                .windows(3)
                .filter(|w| w[0] == "!" && w[1] == "-name")
                .map(|w| w[2])
                .collect();
            let doomed: Vec<String> = files_under(state, dir)
                .into_iter()
                .map(|(path, _)| path)
                .filter(|path| {
                    let name = path.rsplit('/').next().unwrap_or(path);
                    !keep.iter().any(|k| glob_match(k, name))
                })
                .collect();
            for path in doomed {
                state.files.remove(&path);
            }
            output(0, String::new())
        }
        ["find", dir, "-type", "f"] => {
            if !dir_exists(state, dir) {
                return output(1, String::new());
            }
            let listing = files_under(state, dir)
                .into_iter()
                .map(|(path, _)| path + "\n")
                .collect();
            output(0, listing)
        }
        ["rm", "-rf", paths @ ..] | ["rm", "-f", paths @ ..] => {
            for path in paths {
                remove_tree(state, path);
            }
            output(0, String::new())
        }
        ["tar", "-czf", archive, "-C", dir, "."] => {
            let dir = dir.trim_end_matches('/');
            if !dir_exists(state, dir) {
                return output(2, String::new());
            }
            let entries = files_under(state, dir)
                .into_iter()
                .map(|(path, content)| (path[dir.len() + 1..].to_string(), content))
                .collect();
            state.archives.insert(archive.to_string(), entries);
            state.files.insert(archive.to_string(), b"\x1f\x8b".to_vec());
            output(0, String::new())
        }
        ["tar", "-xzf", archive, "-C", dir] => match state.archives.get(*archive).cloned() {
            Some(entries) => {
                for (rel, content) in entries {
                    state.files.insert(shell::join(dir, &rel), content);
                }
                output(0, String::new())
            }
            None => output(2, String::new()),
        },
        ["cp", "-r", source, target] => {
            let source = source.trim_end_matches("/.");
            if !dir_exists(state, source) || !dir_exists(state, target) {
                return output(1, String::new());
            }
            for (path, content) in files_under(state, source) {
                let rel = path[source.len() + 1..].to_string();
                state.files.insert(shell::join(target, &rel), content);
            }
            output(0, String::new())
        }
        ["chmod", "+x", file] => output(
            if state.files.contains_key(*file) { 0 } else { 1 },
            String::new(),
        ),
        _ => output(127, String::new()),
    }
}

#[async_trait]
impl RemoteChannel for FakeChannel {
    async fn exec(&self, command: &str) -> StageResult<CommandResult> {
        let mut state = self.state();
        state.history.push(command.to_string());

        if let Some((_, left)) = state
            .dropped
            .iter_mut()
            .find(|(prefix, left)| *left > 0 && command.starts_with(prefix.as_str()))
        {
            *left -= 1;
            return Err(StageError::Channel("connection reset by peer".to_string()));
        }

        let scripted = state
            .scripted
            .iter_mut()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, queue)| {
                if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                }
            });

        let (exit_code, stdout) = match scripted.flatten() {
            Some(Scripted::ChannelError(message)) => return Err(StageError::Channel(message)),
            Some(Scripted::Output { exit_code, stdout }) => (exit_code, stdout),
            None => {
                let mut combined = String::new();
                let mut exit_code = 0;
                for part in command.split(" && ") {
                    let (code, out) = run_builtin(&mut state, &shell::split(part));
                    combined.push_str(&out);
                    exit_code = code;
                    if code != 0 {
                        break;
                    }
                }
                (exit_code, combined)
            }
        };

        let effects: Vec<(String, Vec<u8>)> = state
            .effects
            .iter()
            .filter(|(prefix, _, _)| command.starts_with(prefix.as_str()))
            .map(|(_, path, content)| (path.clone(), content.clone()))
            .collect();
        for (path, content) in effects {
            add_dir(&mut state, &shell::parent(&path));
            state.files.insert(path, content);
        }

        Ok(CommandResult {
            command: command.to_string(),
            stdout,
            stderr: String::new(),
            exit_code,
            duration_ms: 0,
        })
    }

    async fn copy_to(&self, local: &Path, remote: &str) -> StageResult<()> {
        self.enter_copy().await;
        let result = (|| {
            let mut state = self.state();
            state.history.push(format!("copy_to {remote}"));
            if Self::take_failure(&mut state, remote) {
                return Err(StageError::Transient(format!("scp to {remote} failed")));
            }
            if !dir_exists(&state, &shell::parent(remote)) {
                return Err(StageError::Transient(format!(
                    "scp: {remote}: No such file or directory"
                )));
            }
            let content = std::fs::read(local)?;
            state.files.insert(remote.to_string(), content);
            Ok(())
        })();
        self.leave_copy();
        result
    }

    async fn copy_from(&self, remote: &str, local: &Path) -> StageResult<()> {
        self.enter_copy().await;
        let result = (|| {
            let mut state = self.state();
            state.history.push(format!("copy_from {remote}"));
            if Self::take_failure(&mut state, remote) {
                return Err(StageError::Transient(format!("scp from {remote} failed")));
            }
            let content = state
                .files
                .get(remote)
                .cloned()
                .ok_or_else(|| StageError::Transient(format!("scp: {remote}: not found")))?;
            std::fs::write(local, content)?;
            Ok(())
        })();
        self.leave_copy();
        result
    }
}
