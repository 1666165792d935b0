use colored::*;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

/// Console formatter for the operator-facing layer.
///
/// Each line is colored by severity and prefixed with the OS thread that
/// produced it, which is the fastest way to tell worker activity apart
/// from the IO plane when reading a runtime's console. The detailed
/// file/stderr layer keeps the default format with full metadata.
pub struct ConsoleFormatter;

impl<S, N> FormatEvent<S, N> for ConsoleFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // Buffer the fields so the color covers the whole line.
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let thread = std::thread::current();
        let line = match thread.name() {
            // Worker threads are named worker-<id>; everything else is the
            // IO plane or a test harness thread.
            Some(name) if name.starts_with("worker-") => format!("[{name}] {buffer}"),
            _ => buffer,
        };

        let colored_line = match *event.metadata().level() {
            Level::ERROR => line.red().bold(),
            Level::WARN => line.yellow(),
            Level::INFO => line.normal(),
            Level::DEBUG => line.blue(),
            Level::TRACE => line.dimmed(),
        };

        writeln!(writer, "{}", colored_line)
    }
}
