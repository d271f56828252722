//! Shared fixtures: a scripted tool runner and footage helpers.

#![allow(dead_code)]

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use vidsync_pipeline::tools::{ToolCommand, ToolOutput, ToolRunner};

type Handler = Box<dyn Fn(&ToolCommand) -> ToolOutput + Send + Sync>;

/// Tool runner that answers by executable name and records every call.
/// Tools without a script succeed with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    calls: Mutex<Vec<ToolCommand>>,
    handlers: Mutex<HashMap<String, Handler>>,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(
        &self,
        tool: &str,
        handler: impl Fn(&ToolCommand) -> ToolOutput + Send + Sync + 'static,
    ) {
        self.handlers
            .lock()
            .unwrap()
            .insert(tool.to_string(), Box::new(handler));
    }

    pub fn calls(&self) -> Vec<ToolCommand> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, tool: &str) -> Vec<ToolCommand> {
        self.calls()
            .into_iter()
            .filter(|c| c.tool_name() == tool)
            .collect()
    }
}

impl ToolRunner for ScriptedRunner {
    fn run<'a>(&'a self, cmd: &'a ToolCommand) -> BoxFuture<'a, std::io::Result<ToolOutput>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(cmd.clone());
            let handlers = self.handlers.lock().unwrap();
            Ok(match handlers.get(&cmd.tool_name()) {
                Some(handler) => handler(cmd),
                None => ToolOutput::ok(""),
            })
        })
    }
}

pub fn as_runner(runner: &Arc<ScriptedRunner>) -> Arc<dyn ToolRunner> {
    Arc::clone(runner) as Arc<dyn ToolRunner>
}

/// Value of the argument following `flag`.
pub fn arg_after(cmd: &ToolCommand, flag: &str) -> Option<PathBuf> {
    let pos = cmd.args.iter().position(|a| a == flag)?;
    cmd.args.get(pos + 1).map(PathBuf::from)
}

pub fn last_arg(cmd: &ToolCommand) -> PathBuf {
    cmd.args.last().map(PathBuf::from).unwrap_or_default()
}

pub fn ffprobe_json(duration_secs: f64, creation_time: &str) -> String {
    format!(
        r#"{{"streams":[{{"codec_type":"video","duration":"{duration_secs}","tags":{{"creation_time":"{creation_time}"}}}}],"format":{{"duration":"{duration_secs}"}}}}"#
    )
}

/// Script ffprobe answers per file name: `(duration, creation_time)`.
/// Unknown files fail like a corrupt container.
pub fn script_ffprobe(runner: &ScriptedRunner, clips: &[(&str, f64, &str)]) {
    let table: HashMap<String, (f64, String)> = clips
        .iter()
        .map(|(name, d, t)| (name.to_string(), (*d, t.to_string())))
        .collect();
    runner.on("ffprobe", move |cmd| {
        let file = last_arg(cmd);
        let name = file.file_name().unwrap().to_string_lossy().into_owned();
        match table.get(&name) {
            Some((d, t)) => ToolOutput::ok(ffprobe_json(*d, t)),
            None => ToolOutput::failed(1, "moov atom not found"),
        }
    });
}

/// `mp4_merge a b --out o`: writes the inputs' bytes back to back.
pub fn script_mp4_merge(runner: &ScriptedRunner) {
    runner.on("mp4_merge", |cmd| {
        let out = arg_after(cmd, "--out").unwrap();
        let mut data = Vec::new();
        for input in cmd.args.iter().take_while(|a| *a != "--out") {
            data.extend(std::fs::read(input).unwrap_or_default());
        }
        std::fs::write(out, data).unwrap();
        ToolOutput::ok("")
    });
}

/// Stabilizer with the default `{input} --output {output}` template: copies.
pub fn script_stabilizer(runner: &ScriptedRunner, program: &str) {
    runner.on(program, |cmd| {
        let input = PathBuf::from(&cmd.args[0]);
        let out = arg_after(cmd, "--output").unwrap();
        std::fs::copy(input, out).unwrap();
        ToolOutput::ok("")
    });
}

/// ffmpeg writes something to its last argument (thumbnail or concat output).
pub fn script_ffmpeg(runner: &ScriptedRunner) {
    runner.on("ffmpeg", |cmd| {
        std::fs::write(last_arg(cmd), b"ffmpeg-output").unwrap();
        ToolOutput::ok("")
    });
}

pub fn write_file(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, bytes).unwrap();
}

pub fn set_mtime(path: &Path, secs: u64) -> SystemTime {
    let t = UNIX_EPOCH + Duration::from_secs(secs);
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(t)
        .unwrap();
    t
}
