// Dustsense - Dust particle concentration logger
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

//! Periodically render a plot of the log and push both to a remote git repository.

use crate::aggregate::AggregateRecord;
use crate::datalog::{read_log, LogError};
use crate::metrics::DustMetrics;
use serde::Serialize;
use std::error::Error;
use std::fmt::{self, Formatter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tokio::time::{self, Instant};
use tracing::{Instrument, Level};

const PLOTLY_URL: &str = "https://cdn.plot.ly/plotly-2.16.1.min.js";

/// Potential kinds of errors that can be encountered while publishing
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum PublishErrorKind {
    Io,
    Log,
    Render,
    Command,
}

impl PublishErrorKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            PublishErrorKind::Io => "publish_io",
            PublishErrorKind::Log => "publish_log",
            PublishErrorKind::Render => "publish_render",
            PublishErrorKind::Command => "publish_command",
        }
    }
}

/// Error rendering the plot or pushing the log to the remote repository
#[derive(Debug)]
pub enum PublishError {
    Io(&'static str, io::Error),
    Log(LogError),
    Render(serde_json::Error),
    Command(String, Option<i32>, String),
}

impl PublishError {
    pub fn kind(&self) -> PublishErrorKind {
        match self {
            PublishError::Io(_, _) => PublishErrorKind::Io,
            PublishError::Log(_) => PublishErrorKind::Log,
            PublishError::Render(_) => PublishErrorKind::Render,
            PublishError::Command(_, _, _) => PublishErrorKind::Command,
        }
    }
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::Io(msg, ref e) => write!(f, "{}: {}", msg, e),
            PublishError::Log(ref e) => write!(f, "unable to read log: {}", e),
            PublishError::Render(ref e) => write!(f, "unable to serialize plot data: {}", e),
            PublishError::Command(cmd, Some(code), stderr) => {
                write!(f, "'{}' exited with status {}: {}", cmd, code, stderr.trim())
            }
            PublishError::Command(cmd, None, stderr) => {
                write!(f, "'{}' terminated by signal: {}", cmd, stderr.trim())
            }
        }
    }
}

impl Error for PublishError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PublishError::Io(_, ref e) => Some(e),
            PublishError::Log(ref e) => Some(e),
            PublishError::Render(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<LogError> for PublishError {
    fn from(e: LogError) -> Self {
        PublishError::Log(e)
    }
}

/// Something that makes the log available outside of this machine.
pub trait Publisher {
    fn publish(&self, log_path: &Path) -> Result<(), PublishError>;
}

#[derive(Debug, Serialize)]
struct Marker {
    size: u32,
    color: &'static str,
}

/// Single Plotly trace of concentration over time
#[derive(Debug, Serialize)]
struct ScatterTrace {
    #[serde(rename = "type")]
    kind: &'static str,
    mode: &'static str,
    /// Milliseconds since the epoch, the unit Plotly uses for date axes
    x: Vec<f64>,
    y: Vec<i64>,
    marker: Marker,
}

impl ScatterTrace {
    fn from_records(records: &[AggregateRecord]) -> Self {
        Self {
            kind: "scatter",
            mode: "markers",
            x: records.iter().map(|r| r.window_start * 1000.0).collect(),
            y: records.iter().map(|r| r.concentration).collect(),
            marker: Marker {
                size: 4,
                color: "black",
            },
        }
    }
}

/// Render a scatter plot of concentration over time from the log as a standalone
/// HTML page. Drawing is done in the browser by Plotly.
#[derive(Debug, Clone)]
pub struct PlotRenderer {
    output: PathBuf,
    title: String,
    units: String,
}

impl PlotRenderer {
    pub fn new<P: Into<PathBuf>>(output: P, title: &str, units: &str) -> Self {
        Self {
            output: output.into(),
            title: title.to_owned(),
            units: units.to_owned(),
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    fn render(&self, records: &[AggregateRecord]) -> Result<String, PublishError> {
        let data = [ScatterTrace::from_records(records)];
        let layout = serde_json::json!({
            "title": self.title,
            "xaxis": { "type": "date", "title": "Time" },
            "yaxis": { "title": format!("Concentration ({})", self.units) },
            "plot_bgcolor": "beige",
        });

        let data = serde_json::to_string(&data).map_err(PublishError::Render)?;
        let layout = serde_json::to_string(&layout).map_err(PublishError::Render)?;

        Ok(format!(
            r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>{title}</title>
<script src="{plotly}"></script>
<style>html, body, #plot {{ width: 100%; height: 100%; margin: 0; }}</style>
</head>
<body>
<div id="plot"></div>
<script>
Plotly.newPlot("plot", {data}, {layout}, {{ responsive: true }});
</script>
</body>
</html>
"#,
            title = html_escape(&self.title),
            plotly = PLOTLY_URL,
            data = script_escape(&data),
            layout = script_escape(&layout),
        ))
    }
}

impl Publisher for PlotRenderer {
    fn publish(&self, log_path: &Path) -> Result<(), PublishError> {
        let records = read_log(log_path)?;
        let html = self.render(&records)?;

        // Write next to the destination and rename so readers never see a partial page
        let tmp = self.output.with_extension("html.tmp");
        fs::write(&tmp, html).map_err(|e| PublishError::Io("unable to write plot", e))?;
        fs::rename(&tmp, &self.output).map_err(|e| PublishError::Io("unable to replace plot", e))?;

        tracing::info!(message = "plot updated", path = %self.output.display(), points = records.len());
        Ok(())
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn script_escape(s: &str) -> String {
    s.replace("</", "<\\/")
}

/// Commit the log (and any extra files) and push it with the `git` command line tool.
///
/// Commands run in the directory containing the log, which must be inside a git
/// working copy with a remote configured.
#[derive(Debug, Clone)]
pub struct GitPublisher {
    message: String,
    extra_paths: Vec<PathBuf>,
}

impl GitPublisher {
    pub fn new(message: &str, extra_paths: Vec<PathBuf>) -> Self {
        Self {
            message: message.to_owned(),
            extra_paths,
        }
    }

    fn git(&self, dir: &Path, args: &[&str]) -> Result<(), PublishError> {
        let command = format!("git {}", args.join(" "));
        tracing::debug!(message = "running command", command = %command, dir = %dir.display());

        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| PublishError::Io("unable to run git", e))?;

        if output.status.success() {
            return Ok(());
        }

        Err(PublishError::Command(
            command,
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }

    /// True if anything is staged in the index of the repository at `dir`.
    fn has_staged_changes(&self, dir: &Path) -> Result<bool, PublishError> {
        tracing::debug!(message = "running command", command = "git diff --cached --quiet", dir = %dir.display());

        let output = Command::new("git")
            .args(&["diff", "--cached", "--quiet"])
            .current_dir(dir)
            .output()
            .map_err(|e| PublishError::Io("unable to run git", e))?;

        // exits 1 when there are differences and anything else on failure
        match output.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            code => Err(PublishError::Command(
                "git diff --cached --quiet".to_owned(),
                code,
                String::from_utf8_lossy(&output.stderr).into_owned(),
            )),
        }
    }
}

impl Publisher for GitPublisher {
    fn publish(&self, log_path: &Path) -> Result<(), PublishError> {
        let log_path = fs::canonicalize(log_path).map_err(|e| PublishError::Io("unable to resolve log path", e))?;
        let dir = log_path.parent().unwrap_or_else(|| Path::new("/"));

        let mut paths = vec![log_path.to_string_lossy().into_owned()];
        for p in self.extra_paths.iter().filter(|p| p.exists()) {
            let p = fs::canonicalize(p).map_err(|e| PublishError::Io("unable to resolve path", e))?;
            paths.push(p.to_string_lossy().into_owned());
        }

        self.git(dir, &["pull"])?;

        let mut add = vec!["add"];
        add.extend(paths.iter().map(String::as_str));
        self.git(dir, &add)?;

        // Still push when nothing changed in case an earlier push failed
        if self.has_staged_changes(dir)? {
            self.git(dir, &["commit", "-m", self.message.as_str()])?;
        } else {
            tracing::debug!("no changes to commit");
        }

        self.git(dir, &["push"])?;

        tracing::info!(message = "log pushed", path = %log_path.display());
        Ok(())
    }
}

/// Render the plot and then push the log and the plot.
#[derive(Debug, Clone)]
pub struct PlotAndPush {
    plot: PlotRenderer,
    git: Option<GitPublisher>,
}

impl PlotAndPush {
    /// `push` controls if the log and plot are pushed after rendering or only the
    /// plot is written locally.
    pub fn new(plot: PlotRenderer, message: &str, push: bool) -> Self {
        let git = if push {
            Some(GitPublisher::new(message, vec![plot.output().to_path_buf()]))
        } else {
            None
        };

        Self { plot, git }
    }
}

impl Publisher for PlotAndPush {
    fn publish(&self, log_path: &Path) -> Result<(), PublishError> {
        self.plot.publish(log_path)?;
        match &self.git {
            Some(git) => git.publish(log_path),
            None => Ok(()),
        }
    }
}

/// Call the publisher every `period` forever, starting one period from now.
///
/// Publishing runs on a blocking thread. Failures are logged and counted and the
/// next attempt happens at the next period.
pub async fn run_periodic<P>(publisher: Arc<P>, log_path: PathBuf, period: Duration, metrics: DustMetrics)
where
    P: Publisher + Send + Sync + 'static,
{
    let mut interval = time::interval_at(Instant::now() + period, period);

    loop {
        let _ = interval.tick().await;
        let publisher_ref = publisher.clone();
        let path_ref = log_path.clone();

        let res = task::spawn_blocking(move || publisher_ref.publish(&path_ref))
            .instrument(tracing::span!(Level::DEBUG, "publish"))
            .await;

        match res {
            Ok(Ok(_)) => metrics.published(),
            Ok(Err(e)) => {
                metrics.error(e.kind().as_label());
                tracing::error!(message = "unable to publish log, will retry next period", error = %e);
            }
            Err(e) => {
                metrics.error(PublishErrorKind::Io.as_label());
                tracing::error!(message = "publish task failed", error = %e);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{run_periodic, GitPublisher, PlotAndPush, PlotRenderer, PublishError, PublishErrorKind, Publisher};
    use crate::aggregate::AggregateRecord;
    use crate::datalog::LogWriter;
    use crate::metrics::DustMetrics;
    use crate::sensor::test::scratch_path;
    use prometheus::Registry;
    use std::fs;
    use std::path::Path;
    use std::process::Command;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn write_log(path: &Path) {
        let mut writer = LogWriter::open(path).unwrap();
        writer.append(&AggregateRecord::new(1_650_000_000.0, 1.5, 30.0, 420)).unwrap();
        writer.append(&AggregateRecord::new(1_650_000_030.0, 0.5, 30.0, 140)).unwrap();
    }

    #[test]
    fn test_plot_renderer_writes_page() {
        let log = scratch_path("data.csv");
        let plot = log.with_file_name("index.html");
        write_log(&log);

        let renderer = PlotRenderer::new(&plot, "Dust </script> & friends", "particles per 0.01 ft³");
        renderer.publish(&log).unwrap();

        let html = fs::read_to_string(&plot).unwrap();
        assert!(html.contains("Plotly.newPlot"));
        assert!(html.contains("[1650000000000.0,1650000030000.0]"));
        assert!(html.contains("[420,140]"));
        assert!(html.contains("<title>Dust &lt;/script&gt; &amp; friends</title>"));
        assert!(!html.contains("Dust </script>"));
        assert!(!plot.with_extension("html.tmp").exists());
    }

    #[test]
    fn test_plot_renderer_missing_log() {
        let log = scratch_path("missing.csv");
        let renderer = PlotRenderer::new(log.with_file_name("index.html"), "Dust", "units");

        let err = renderer.publish(&log).unwrap_err();
        assert_eq!(PublishErrorKind::Log, err.kind());
    }

    #[test]
    fn test_git_publisher_missing_log() {
        let publisher = GitPublisher::new("update data", Vec::new());
        let err = publisher.publish(&scratch_path("missing.csv")).unwrap_err();

        assert_eq!(PublishErrorKind::Io, err.kind());
    }

    #[test]
    fn test_git_publisher_outside_repository() {
        // The system temp directory is not a git working copy so `git pull` fails,
        // or git isn't installed at all. Either way the error is returned.
        let log = scratch_path("data.csv");
        write_log(&log);

        let publisher = GitPublisher::new("update data", Vec::new());
        let err = publisher.publish(&log).unwrap_err();

        assert!(matches!(err.kind(), PublishErrorKind::Command | PublishErrorKind::Io));
    }

    /// Run git in `dir`, returning false if git couldn't be run at all.
    fn run_git(dir: &Path, args: &[&str]) -> bool {
        match Command::new("git").args(args).current_dir(dir).output() {
            Ok(out) => {
                assert!(out.status.success(), "git {:?}: {}", args, String::from_utf8_lossy(&out.stderr));
                true
            }
            Err(_) => false,
        }
    }

    #[test]
    fn test_git_publisher_unchanged_log_with_untracked_files() {
        let root = scratch_path("repos");
        fs::create_dir_all(&root).unwrap();
        if !run_git(&root, &["init", "--bare", "-q", "remote.git"]) {
            // git isn't installed
            return;
        }

        run_git(&root, &["clone", "-q", "remote.git", "work"]);
        let work = root.join("work");
        run_git(&work, &["config", "user.email", "dustsense@example.com"]);
        run_git(&work, &["config", "user.name", "dustsense"]);

        let log = work.join("data.csv");
        write_log(&log);
        run_git(&work, &["add", "data.csv"]);
        run_git(&work, &["commit", "-q", "-m", "initial data"]);
        run_git(&work, &["push", "-q", "-u", "origin", "HEAD"]);
        fs::write(work.join("notes.txt"), "not part of the data").unwrap();

        let publisher = GitPublisher::new("update data", Vec::new());
        publisher.publish(&log).unwrap();

        // A new row is committed and pushed on the next publish
        LogWriter::open(&log)
            .unwrap()
            .append(&AggregateRecord::new(1_650_000_060.0, 0.0, 30.0, 1))
            .unwrap();
        publisher.publish(&log).unwrap();

        let out = Command::new("git")
            .args(&["log", "--format=%s", "@{u}"])
            .current_dir(&work)
            .output()
            .unwrap();
        let subjects = String::from_utf8_lossy(&out.stdout).into_owned();
        assert_eq!(vec!["update data", "initial data"], subjects.lines().collect::<Vec<_>>());
    }

    #[test]
    fn test_plot_and_push_without_push() {
        let log = scratch_path("data.csv");
        let plot = log.with_file_name("index.html");
        write_log(&log);

        let publisher = PlotAndPush::new(PlotRenderer::new(&plot, "Dust", "units"), "update data", false);
        publisher.publish(&log).unwrap();

        assert!(plot.exists());
    }

    struct CountingPublisher {
        calls: AtomicUsize,
    }

    impl Publisher for CountingPublisher {
        fn publish(&self, _log_path: &Path) -> Result<(), PublishError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n % 2 == 0 {
                Err(PublishError::Command("git push".to_owned(), Some(1), "rejected".to_owned()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_run_periodic_retries_after_failure() {
        let publisher = Arc::new(CountingPublisher {
            calls: AtomicUsize::new(0),
        });
        let metrics = DustMetrics::new(&Registry::new()).unwrap();

        let task = tokio::spawn(run_periodic(
            publisher.clone(),
            scratch_path("data.csv"),
            Duration::from_millis(20),
            metrics.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(500)).await;
        task.abort();

        assert!(publisher.calls.load(Ordering::SeqCst) >= 2);
        assert!(metrics.errors("publish_command") >= 1);
        assert!(metrics.publishes() >= 1);
    }
}
