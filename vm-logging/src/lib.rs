//! Process-wide `tracing` setup for the provisioner binary.
//!
//! Library crates only emit through `tracing` macros. The binary reads
//! [`LogSettings::from_env`] and calls [`init_subscriber`] once at startup.
//!
//! | variable | values | default |
//! |----------|--------|---------|
//! | `LOG_LEVEL` | any `EnvFilter` directive | `info` |
//! | `LOG_OUTPUT` | `console`, `file`, `both` | `console` |
//! | `LOG_FORMAT` | `human`, `json` | `human` |
//! | `LOG_FILE_PATH` | path of the daily rolling log | `/tmp/vm-api.log` |
//! | `LOG_SUBJECTS` | `field:value,...` | unset |
//!
//! `RUST_LOG` takes precedence over `LOG_LEVEL` when set.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::field::{Field, Visit};
use tracing::{span, Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILE: &str = "/tmp/vm-api.log";

/// Dependencies that are noisy at `debug`.
const QUIET_TARGETS: &[&str] = &["hyper=warn", "sqlx=warn", "tokio=warn"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

/// One `field:value` pair of `LOG_SUBJECTS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub field: String,
    pub value: String,
}

impl Subject {
    fn matches(&self, recorded: &str) -> bool {
        self.value == "*" || recorded.contains(&self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub output: LogOutput,
    pub format: LogFormat,
    pub file_path: PathBuf,
    pub subjects: Vec<Subject>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Console,
            format: LogFormat::Human,
            file_path: PathBuf::from(DEFAULT_LOG_FILE),
            subjects: Vec::new(),
        }
    }
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let output = match lookup("LOG_OUTPUT").as_deref().map(str::trim) {
            Some("file") => LogOutput::File,
            Some("both") => LogOutput::Both,
            _ => LogOutput::Console,
        };
        let format = match lookup("LOG_FORMAT").as_deref().map(str::trim) {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Human,
        };

        Self {
            level: lookup("LOG_LEVEL")
                .filter(|level| !level.trim().is_empty())
                .unwrap_or(defaults.level),
            output,
            format,
            file_path: lookup("LOG_FILE_PATH")
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.file_path),
            subjects: lookup("LOG_SUBJECTS")
                .map(|raw| parse_subjects(&raw))
                .unwrap_or_default(),
        }
    }
}

/// Parse `field:value` pairs. Malformed entries are skipped.
pub fn parse_subjects(raw: &str) -> Vec<Subject> {
    raw.split(',')
        .filter_map(|entry| {
            let (field, value) = entry.split_once(':')?;
            let (field, value) = (field.trim(), value.trim());
            if field.is_empty() || value.is_empty() {
                return None;
            }
            Some(Subject {
                field: field.to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}

/// Fields recorded on a span, stored in its extensions.
#[derive(Debug, Default)]
struct SpanFields(HashMap<String, String>);

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}"));
    }
}

/// Drops events unless an enclosing span matches every subject.
///
/// Spans themselves are always created so their fields can be inspected.
pub struct SubjectFilterLayer {
    subjects: Vec<Subject>,
}

impl SubjectFilterLayer {
    pub fn new(subjects: Vec<Subject>) -> Self {
        Self { subjects }
    }
}

impl<S> Layer<S> for SubjectFilterLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        if self.subjects.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            let mut fields = SpanFields::default();
            attrs.record(&mut FieldVisitor(&mut fields.0));
            span.extensions_mut().insert(fields);
        }
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        if self.subjects.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            let mut extensions = span.extensions_mut();
            if let Some(fields) = extensions.get_mut::<SpanFields>() {
                values.record(&mut FieldVisitor(&mut fields.0));
            }
        }
    }

    fn event_enabled(&self, event: &Event<'_>, ctx: Context<'_, S>) -> bool {
        if self.subjects.is_empty() {
            return true;
        }
        let Some(scope) = ctx.event_scope(event) else {
            return false;
        };

        // Innermost span wins when a field is recorded at several levels.
        let mut seen: HashMap<String, String> = HashMap::new();
        for span in scope {
            if let Some(fields) = span.extensions().get::<SpanFields>() {
                for (key, value) in &fields.0 {
                    seen.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }

        self.subjects.iter().all(|subject| {
            seen.get(&subject.field)
                .is_some_and(|recorded| subject.matches(recorded))
        })
    }
}

fn env_filter(level: &str) -> EnvFilter {
    let base = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    QUIET_TARGETS
        .iter()
        .filter_map(|directive| directive.parse::<Directive>().ok())
        .fold(base, EnvFilter::add_directive)
}

fn file_writer(path: &Path) -> (tracing_appender::non_blocking::NonBlocking, WorkerGuard) {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("/tmp"));
    let file_name = path
        .file_name()
        .unwrap_or_else(|| "vm-api.log".as_ref());
    tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name))
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// life of the process.
pub fn init_subscriber(settings: &LogSettings) -> Option<WorkerGuard> {
    let mut guard = None;
    let writer = match settings.output {
        LogOutput::Console => BoxMakeWriter::new(std::io::stdout),
        LogOutput::File => {
            let (file, file_guard) = file_writer(&settings.file_path);
            guard = Some(file_guard);
            BoxMakeWriter::new(file)
        }
        LogOutput::Both => {
            let (file, file_guard) = file_writer(&settings.file_path);
            guard = Some(file_guard);
            BoxMakeWriter::new(std::io::stdout.and(file))
        }
    };

    let fmt_layer = match settings.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .boxed(),
        LogFormat::Human => tracing_subscriber::fmt::layer()
            .with_ansi(settings.output == LogOutput::Console)
            .with_writer(writer)
            .boxed(),
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter(&settings.level))
        .with(SubjectFilterLayer::new(settings.subjects.clone()))
        .with(fmt_layer)
        .try_init();
    if let Err(err) = installed {
        eprintln!("tracing subscriber already installed: {err}");
    }

    guard
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing::{info, info_span};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn capture(subjects: &str, emit: impl FnOnce()) -> String {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::registry()
            .with(SubjectFilterLayer::new(parse_subjects(subjects)))
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(captured.clone()),
            );
        tracing::subscriber::with_default(subscriber, emit);
        captured.text()
    }

    #[test]
    fn test_defaults_without_environment() {
        let settings = LogSettings::from_lookup(|_| None);
        assert_eq!(settings, LogSettings::default());
        assert_eq!(settings.file_path, PathBuf::from("/tmp/vm-api.log"));
    }

    #[test]
    fn test_settings_from_variables() {
        let settings = LogSettings::from_lookup(|key| match key {
            "LOG_LEVEL" => Some("debug".into()),
            "LOG_OUTPUT" => Some("both".into()),
            "LOG_FORMAT" => Some("json".into()),
            "LOG_FILE_PATH" => Some("/var/log/vm/api.log".into()),
            "LOG_SUBJECTS" => Some("environment:pve-lab".into()),
            _ => None,
        });

        assert_eq!(settings.level, "debug");
        assert_eq!(settings.output, LogOutput::Both);
        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(settings.file_path, PathBuf::from("/var/log/vm/api.log"));
        assert_eq!(settings.subjects.len(), 1);
    }

    #[test]
    fn test_parse_subjects_skips_malformed_entries() {
        let subjects = parse_subjects("request_id:abc, environment : pve-lab ,junk,:x,y:");
        assert_eq!(
            subjects,
            vec![
                Subject {
                    field: "request_id".into(),
                    value: "abc".into()
                },
                Subject {
                    field: "environment".into(),
                    value: "pve-lab".into()
                },
            ]
        );
    }

    #[test]
    fn test_no_subjects_logs_everything() {
        let out = capture("", || info!("outside any span"));
        assert!(out.contains("outside any span"));
    }

    #[test]
    fn test_subjects_isolate_one_entity() {
        let out = capture("request_id:abc", || {
            info!("outside any span");
            info_span!("request_run", request_id = "abc-123").in_scope(|| info!("kept event"));
            info_span!("request_run", request_id = "xyz-456").in_scope(|| info!("dropped event"));
        });

        assert!(out.contains("kept event"));
        assert!(!out.contains("dropped event"));
        assert!(!out.contains("outside any span"));
    }

    #[test]
    fn test_subjects_match_fields_of_enclosing_spans() {
        let out = capture("deployment_id:*,environment:pve-lab", || {
            let deployment = info_span!("deployment_run", deployment_id = %"d-1");
            let _d = deployment.enter();
            info_span!("request_run", environment = "pve-lab").in_scope(|| info!("child event"));
            info_span!("request_run", environment = "vc-prod").in_scope(|| info!("other env"));
        });

        assert!(out.contains("child event"));
        assert!(!out.contains("other env"));
    }
}
