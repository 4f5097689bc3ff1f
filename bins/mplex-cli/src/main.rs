//! tao-mplex - MPEG-1/2 节目流复用命令行工具
//!
//! 对标 mjpegtools 的 mplex, 将 MPEG 视频、MPEG 音频、AC-3 与 LPCM 基本流
//! 复用为 VCD/SVCD/DVD 或通用格式的节目流.

mod logging;

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::PathBuf;
use std::process;

use mplex_mux::{FileSink, MuxConfig, MuxFormat, Multiplexor, StreamInput};

#[derive(Parser, Debug)]
#[command(name = "tao-mplex", about = "纯 Rust MPEG-1/2 节目流复用工具")]
struct Cli {
    /// 输入基本流 (按扩展名/起始字节识别类型)
    inputs: Vec<PathBuf>,

    /// 输出文件模板, `%d` 替换为分段序号
    #[arg(short, long)]
    output: Option<String>,

    /// 输出格式, 名称或 0-8 编号 (见 --list-formats)
    #[arg(short, long)]
    format: Option<MuxFormat>,

    /// 复用码率 (kbit/s), 缺省自动计算
    #[arg(short = 'r', long = "mux-bitrate")]
    mux_bitrate: Option<u32>,

    /// 可变码率复用
    #[arg(short = 'V', long)]
    vbr: bool,

    /// 每包分组数 (仅通用格式)
    #[arg(short = 'p', long)]
    packets_per_pack: Option<u32>,

    /// 扇区大小 (仅通用格式)
    #[arg(short = 's', long)]
    sector_size: Option<usize>,

    /// 单个输出文件上限 (MB)
    #[arg(short = 'S', long = "max-segment-size")]
    max_segment_mb: Option<u64>,

    /// 每个序列分段写入单独文件
    #[arg(short = 'M', long)]
    multifile: bool,

    /// 视频时间戳偏移 (毫秒)
    #[arg(short = 'O', long, allow_negative_numbers = true)]
    video_offset: Option<i64>,

    /// 音频时间戳偏移 (毫秒)
    #[arg(long, allow_negative_numbers = true)]
    audio_offset: Option<i64>,

    /// 视频解码缓冲 (KiB)
    #[arg(short = 'b', long)]
    video_buffer: Option<u32>,

    /// 起始延迟扇区数, 覆盖自动估算
    #[arg(long)]
    run_in_sectors: Option<u32>,

    /// 每个包都写系统头
    #[arg(long)]
    always_sys_header: bool,

    /// 欠载过多时不中止
    #[arg(long)]
    ignore_underruns: bool,

    /// JSON 配置文件, 命令行参数优先
    #[arg(long)]
    config: Option<PathBuf>,

    /// 输出合并后的配置 JSON 并退出
    #[arg(long)]
    dump_config: bool,

    /// 复用结束后在 stdout 输出统计 JSON
    #[arg(long)]
    summary_json: bool,

    /// 列出支持的输出格式
    #[arg(long)]
    list_formats: bool,

    /// 日志级别 (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// 同时写入按天滚动的日志文件到该目录
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = logging::init("tao-mplex", cli.verbose, cli.log_dir.as_deref()) {
        eprintln!("警告: {e:#}");
    }

    if let Err(e) = run(&cli) {
        log::error!("{e:#}");
        eprintln!("错误: {e:#}");
        process::exit(1);
    }
}

/// 合并 JSON 配置与命令行参数
fn build_config(cli: &Cli) -> Result<MuxConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("读取配置文件 {} 失败", path.display()))?;
            MuxConfig::from_json(&text)
                .with_context(|| format!("解析配置文件 {} 失败", path.display()))?
        }
        None => MuxConfig::default(),
    };
    if let Some(format) = cli.format {
        config.format = format;
    }
    if let Some(kbps) = cli.mux_bitrate {
        config.data_rate_kbps = kbps;
    }
    config.vbr |= cli.vbr;
    if cli.packets_per_pack.is_some() {
        config.packets_per_pack = cli.packets_per_pack;
    }
    if cli.sector_size.is_some() {
        config.sector_size = cli.sector_size;
    }
    if let Some(mb) = cli.max_segment_mb {
        config.max_segment_size = mb.saturating_mul(1024 * 1024);
    }
    config.multifile_segment |= cli.multifile;
    if let Some(ms) = cli.video_offset {
        config.video_offset_ms = ms;
    }
    if let Some(ms) = cli.audio_offset {
        config.audio_offset_ms = ms;
    }
    if cli.video_buffer.is_some() {
        config.video_buffer_kb = cli.video_buffer;
    }
    if cli.run_in_sectors.is_some() {
        config.run_in_sectors = cli.run_in_sectors;
    }
    config.always_sys_header |= cli.always_sys_header;
    config.ignore_underruns |= cli.ignore_underruns;
    Ok(config)
}

fn run(cli: &Cli) -> Result<()> {
    if cli.list_formats {
        for (i, format) in MuxFormat::ALL.iter().enumerate() {
            println!("{i}: {format}");
        }
        return Ok(());
    }

    let config = build_config(cli)?;
    if cli.dump_config {
        println!("{}", config.to_json()?);
        return Ok(());
    }
    if cli.inputs.is_empty() {
        bail!("未指定输入流");
    }
    let output = cli.output.as_deref().context("必须指定输出文件 (-o <模板>)")?;

    log::info!(
        "tao-mplex {} -- 格式 {}, {} 条输入",
        env!("CARGO_PKG_VERSION"),
        config.format,
        cli.inputs.len()
    );
    let inputs = cli
        .inputs
        .iter()
        .map(|path| {
            StreamInput::open(path).with_context(|| format!("打开输入 {} 失败", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    for input in &inputs {
        log::info!("输入: {} ({})", input.name, input.kind.name());
    }

    let sink = FileSink::create(output).with_context(|| format!("创建输出 {output} 失败"))?;
    let mut mux = Multiplexor::new(config, inputs, sink).context("初始化复用器失败")?;
    let summary = mux.multiplex().context("复用失败")?;
    for path in mux.sink().paths() {
        log::info!("输出: {}", path.display());
    }
    if cli.summary_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    Ok(())
}
