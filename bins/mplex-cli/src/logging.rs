//! 日志初始化.
//!
//! 复用库只经 `log` 门面输出, 这里用 tracing-subscriber 接收 (tracing-log 桥接).
//! - 终端: stderr, 彩色级别, info 起步, `-v` 提升到 debug
//! - 文件: 仅在指定 `--log-dir` 时启用, 按天滚动, 级别随 `-v` 提升, 可被 MPLEX_LOG 覆盖

use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use chrono::Local;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, Layer as FmtLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// 文件日志级别覆盖变量
pub const LOG_ENV: &str = "MPLEX_LOG";

/// 后台写线程守卫, 进程结束前不能释放
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn level_name(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// 安装全局日志订阅者
pub fn init(file_prefix: &str, verbosity: u8, log_dir: Option<&Path>) -> Result<()> {
    let console = FmtLayer::default()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .event_format(LineFormat::CONSOLE)
        .with_filter(EnvFilter::new(level_name(verbosity.min(1))));

    let file = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("创建日志目录 {} 失败", dir.display()))?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(file_prefix)
                .filename_suffix("log")
                .build(dir)
                .context("创建日志文件失败")?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            FILE_GUARD.set(guard).ok();
            let filter = EnvFilter::try_from_env(LOG_ENV)
                .unwrap_or_else(|_| EnvFilter::new(level_name(verbosity)));
            Some(
                FmtLayer::default()
                    .with_writer(writer)
                    .with_ansi(false)
                    .event_format(LineFormat::FILE)
                    .with_filter(filter),
            )
        }
        None => None,
    };

    Registry::default()
        .with(console)
        .with(file)
        .try_init()
        .context("日志系统已初始化")
}

/// 单行日志格式: `[时间] 级别 > 消息`
#[derive(Clone, Copy)]
struct LineFormat {
    color: bool,
    date: bool,
}

impl LineFormat {
    const CONSOLE: Self = Self {
        color: true,
        date: false,
    };
    const FILE: Self = Self {
        color: false,
        date: true,
    };

    fn color_code(level: &Level) -> &'static str {
        match *level {
            Level::ERROR => "\x1b[31m",
            Level::WARN => "\x1b[33m",
            Level::INFO => "\x1b[32m",
            _ => "\x1b[34m",
        }
    }
}

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let now = Local::now();
        let stamp = if self.date {
            now.format("%Y-%m-%d %H:%M:%S%.3f")
        } else {
            now.format("%H:%M:%S%.3f")
        };
        let level = event.metadata().level();
        if self.color {
            write!(
                writer,
                "[{}] {}{:5}\x1b[0m > ",
                stamp,
                Self::color_code(level),
                level
            )?;
        } else {
            write!(writer, "[{}] {:5} > ", stamp, level)?;
        }
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
