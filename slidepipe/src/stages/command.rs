//! Stages backed by an external program.

use super::{Stage, StageContext};
use crate::core::{StageId, StageOutput, StageStats};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, error, info};

/// Runs an external program for one pipeline position.
///
/// The program receives
/// `--in <dir> --out <dir> --stats-out <file> --batch-size <n>
/// --link-strategy <s> --samples-per-class <k>` plus `--model`,
/// `--threshold`, `--image-size` and `--companion` when they apply. A cell
/// stage in detector mode also gets `--iou`, `--imgsz`, `--classes` and
/// `--by-class-links`. It must write the stats file before exiting with status 0; any other exit status
/// fails the stage.
#[derive(Debug, Clone)]
pub struct CommandStage {
    id: StageId,
    program: PathBuf,
    args: Vec<OsString>,
}

impl CommandStage {
    /// Creates a stage running `program` for `id`.
    pub fn new(id: StageId, program: impl Into<PathBuf>) -> Self {
        Self {
            id,
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Arguments placed before the generated ones.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The generated arguments for one invocation.
    #[must_use]
    pub fn invocation_args(&self, ctx: &StageContext) -> Vec<OsString> {
        let config = ctx.config();
        let mut args: Vec<OsString> = Vec::new();
        let mut push = |flag: &str, value: OsString| {
            args.push(flag.into());
            args.push(value);
        };
        push("--in", ctx.input_dir().into());
        push("--out", ctx.output_dir().into());
        push("--stats-out", ctx.stats_path().into());
        push("--batch-size", config.batch_size.to_string().into());
        push("--link-strategy", config.link_strategy.as_str().into());
        push("--samples-per-class", config.samples_per_class.to_string().into());
        if let Some(model) = &config.model {
            push("--model", model.into());
        }
        if let Some(threshold) = config.threshold {
            push("--threshold", threshold.to_string().into());
        }
        if let Some(size) = config.image_size {
            push("--image-size", size.to_string().into());
        }
        if let Some(companion) = ctx.companion_dir() {
            push("--companion", companion.into());
        }
        if let Some(detection) = &config.detection {
            push("--iou", detection.iou.to_string().into());
            push("--imgsz", detection.image_size.to_string().into());
            if let Some(classes) = &detection.classes {
                let ids: Vec<String> = classes.iter().map(u32::to_string).collect();
                push("--classes", ids.join(",").into());
            }
            if detection.by_class_links {
                args.push("--by-class-links".into());
            }
        }
        args
    }
}

fn tail(bytes: &[u8], lines: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[async_trait]
impl Stage for CommandStage {
    fn id(&self) -> StageId {
        self.id
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        if let Err(reason) = ctx.cancel_token().check() {
            return StageOutput::cancel(reason);
        }
        if let Err(e) = std::fs::create_dir_all(ctx.output_dir()) {
            return StageOutput::fail(format!("cannot create {}: {e}", ctx.output_dir().display()));
        }

        let args = self.invocation_args(ctx);
        info!(stage = %self.id, program = %self.program.display(), "running external stage");
        debug!(stage = %self.id, ?args, "external stage arguments");

        let output = match Command::new(&self.program)
            .args(&self.args)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                error!(stage = %self.id, error = %e, "cannot start external stage");
                return StageOutput::fail(format!("cannot start {}: {e}", self.program.display()));
            }
        };

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            debug!(stage = %self.id, "{line}");
        }
        if !output.status.success() {
            let stderr = tail(&output.stderr, 20);
            error!(stage = %self.id, status = %output.status, stderr = %stderr, "external stage failed");
            return StageOutput::fail(format!("{} exited with {}: {stderr}", self.program.display(), output.status));
        }

        match StageStats::read_json(ctx.stats_path()) {
            Ok(stats) => StageOutput::ok(stats),
            Err(e) => StageOutput::fail(format!(
                "exited successfully but stats at {} are unreadable: {e}",
                ctx.stats_path().display()
            )),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::DetectionParams;
    use crate::core::StageStatus;
    use crate::testing::{self, fixtures};
    use std::path::Path;

    const WRITE_STATS: &str = r#"
while [ $# -gt 0 ]; do
  case "$1" in --stats-out) out="$2"; shift;; esac
  shift
done
mkdir -p "$(dirname "$out")"
printf '{"processed": 3, "saved": 2, "discarded": 1}' > "$out"
"#;

    fn context(dir: &Path) -> StageContext {
        StageContext::new(
            "s",
            fixtures::stage_config(StageId::BackgroundFilter),
            dir.join("01_tiles"),
            dir.join("02_bg_filter"),
            dir.join("reports/bg_stats.json"),
        )
    }

    fn shell(script: &str) -> CommandStage {
        CommandStage::new(StageId::BackgroundFilter, "sh").with_args(["-c", script, "stage"])
    }

    #[test]
    fn test_invocation_args() {
        let ctx = context(Path::new("/w")).with_companion_dir("/w/tissue");
        let args = shell("true").invocation_args(&ctx);
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();

        let value = |flag: &str| {
            let i = args.iter().position(|a| a == flag).unwrap();
            args[i + 1].clone()
        };
        assert_eq!(value("--in"), "/w/01_tiles");
        assert_eq!(value("--stats-out"), "/w/reports/bg_stats.json");
        assert_eq!(value("--link-strategy"), "copy");
        assert_eq!(value("--threshold"), "0.5");
        assert_eq!(value("--model"), "/models/bg.bin");
        assert_eq!(value("--companion"), "/w/tissue");
        assert!(!args.contains(&"--image-size".to_string()));
        assert!(!args.contains(&"--iou".to_string()));
    }

    #[test]
    fn test_detector_invocation_args() {
        let mut config = fixtures::stage_config(StageId::Cells);
        config.detection = Some(DetectionParams {
            iou: 0.5,
            image_size: 320,
            classes: Some(vec![0, 2]),
            by_class_links: true,
        });
        let ctx = StageContext::new("s", config, "/w/apt", "/w/cells", "/w/cells_stats.json");
        let args: Vec<String> = CommandStage::new(StageId::Cells, "detect")
            .invocation_args(&ctx)
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let tail: Vec<&str> = args.iter().rev().take(7).rev().map(String::as_str).collect();
        assert_eq!(
            tail,
            vec!["--iou", "0.5", "--imgsz", "320", "--classes", "0,2", "--by-class-links"]
        );
    }

    #[tokio::test]
    async fn test_success_reads_written_stats() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        let output = shell(WRITE_STATS).execute(&ctx).await;

        let stats = testing::output_stats(&output);
        testing::assert_counts(stats, 3, 2, 1, 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        let output = shell("echo boom >&2; exit 3").execute(&ctx).await;

        testing::assert_output_status(&output, StageStatus::Fail);
        assert!(output.reason().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_success_without_stats_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        let output = shell("exit 0").execute(&ctx).await;

        testing::assert_output_failed(&output);
        assert!(output.reason().unwrap().contains("stats"));
    }
}
