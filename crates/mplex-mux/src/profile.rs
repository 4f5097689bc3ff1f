//! 输出格式 (profile) 与语法参数.
//!
//! 用户配置 `MuxConfig` 在会话开始时解析为一组固定的 `SyntaxParams`:
//! 扇区大小、传输帧大小、每包分组数、系统头与缓冲记录策略、码率与分段规则等.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use mplex_core::{MuxError, MuxResult};

/// 输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MuxFormat {
    /// 通用 MPEG-1
    #[default]
    #[serde(alias = "mpeg1")]
    GenericMpeg1,
    /// VCD (标准码率)
    Vcd,
    /// VCD (非标准码率)
    VcdNsr,
    /// 通用 MPEG-2
    #[serde(alias = "mpeg2")]
    GenericMpeg2,
    /// SVCD (标准码率)
    Svcd,
    /// SVCD (非标准码率)
    SvcdNsr,
    /// VCD 静止图像
    #[serde(alias = "vcd-stills")]
    VcdStill,
    /// SVCD 静止图像
    #[serde(alias = "svcd-stills")]
    SvcdStill,
    /// DVD-Video (带导航扇区)
    Dvd,
}

impl MuxFormat {
    /// 全部格式, 顺序即数字编号 0..=8
    pub const ALL: [MuxFormat; 9] = [
        MuxFormat::GenericMpeg1,
        MuxFormat::Vcd,
        MuxFormat::VcdNsr,
        MuxFormat::GenericMpeg2,
        MuxFormat::Svcd,
        MuxFormat::SvcdNsr,
        MuxFormat::VcdStill,
        MuxFormat::SvcdStill,
        MuxFormat::Dvd,
    ];

    /// 短名称
    pub fn name(self) -> &'static str {
        match self {
            Self::GenericMpeg1 => "mpeg1",
            Self::Vcd => "vcd",
            Self::VcdNsr => "vcd-nsr",
            Self::GenericMpeg2 => "mpeg2",
            Self::Svcd => "svcd",
            Self::SvcdNsr => "svcd-nsr",
            Self::VcdStill => "vcd-stills",
            Self::SvcdStill => "svcd-stills",
            Self::Dvd => "dvd",
        }
    }

    /// MPEG 系统层版本 (1 或 2)
    pub fn mpeg_version(self) -> u8 {
        match self {
            Self::GenericMpeg1 | Self::Vcd | Self::VcdNsr | Self::VcdStill => 1,
            _ => 2,
        }
    }

    pub fn is_vcd(self) -> bool {
        matches!(self, Self::Vcd | Self::VcdNsr | Self::VcdStill)
    }

    pub fn is_svcd(self) -> bool {
        matches!(self, Self::Svcd | Self::SvcdNsr | Self::SvcdStill)
    }

    pub fn is_stills(self) -> bool {
        matches!(self, Self::VcdStill | Self::SvcdStill)
    }

    /// 是否允许用户覆盖扇区大小与每包分组数
    pub fn is_generic(self) -> bool {
        matches!(self, Self::GenericMpeg1 | Self::GenericMpeg2)
    }
}

impl fmt::Display for MuxFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MuxFormat {
    type Err = MuxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase();
        if let Ok(idx) = key.parse::<usize>() {
            return Self::ALL.get(idx).copied().ok_or_else(|| {
                MuxError::InvalidArgument(format!("格式编号 {} 超出 0..=8", idx))
            });
        }
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.name() == key)
            .ok_or_else(|| MuxError::InvalidArgument(format!("未知输出格式: {}", s)))
    }
}

/// 用户配置, 会话开始时一次性提供
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// 输出格式
    pub format: MuxFormat,
    /// 目标码率 (kbit/s), 0 表示由基本流码率自动计算
    pub data_rate_kbps: u32,
    /// 可变码率复用
    pub vbr: bool,
    /// 每包分组数 (仅通用格式)
    pub packets_per_pack: Option<u32>,
    /// 扇区大小 (仅通用格式)
    pub sector_size: Option<usize>,
    /// 每个包都带系统头 (仅通用格式)
    pub always_sys_header: bool,
    /// 单个输出文件的最大字节数, 0 表示不限 (DVD 默认 1GiB)
    pub max_segment_size: u64,
    /// 序列分段输出为独立文件
    pub multifile_segment: bool,
    /// 视频时间戳偏移 (毫秒)
    pub video_offset_ms: i64,
    /// 音频时间戳偏移 (毫秒)
    pub audio_offset_ms: i64,
    /// 视频解码缓冲大小 (KiB), 缺省使用格式默认值
    pub video_buffer_kb: Option<u32>,
    /// 欠载超过上限时仍继续
    pub ignore_underruns: bool,
    /// 覆盖自动计算的起始延迟扇区数
    pub run_in_sectors: Option<u32>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            format: MuxFormat::GenericMpeg1,
            data_rate_kbps: 0,
            vbr: false,
            packets_per_pack: None,
            sector_size: None,
            always_sys_header: false,
            max_segment_size: 0,
            multifile_segment: false,
            video_offset_ms: 0,
            audio_offset_ms: 0,
            video_buffer_kb: None,
            ignore_underruns: false,
            run_in_sectors: None,
        }
    }
}

impl MuxConfig {
    /// 从 JSON 文本加载 (缺省字段取默认值)
    pub fn from_json(text: &str) -> MuxResult<Self> {
        serde_json::from_str(text).map_err(|e| MuxError::Config(format!("配置 JSON 无效: {}", e)))
    }

    /// 导出为 JSON
    pub fn to_json(&self) -> MuxResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| MuxError::Internal(e.to_string()))
    }
}

/// 由格式解析出的语法参数
#[derive(Debug, Clone, PartialEq)]
pub struct SyntaxParams {
    pub format: MuxFormat,
    /// 系统层版本 1 或 2
    pub mpeg: u8,
    /// 输出码率 (字节/秒), 0 表示自动计算
    pub data_rate: u32,
    pub vbr: bool,
    pub packets_per_pack: u32,
    /// 首个包带系统头
    pub sys_header_in_pack1: bool,
    /// 每个包都带系统头
    pub always_sys_header_in_pack: bool,
    pub sector_size: usize,
    /// 传输层扇区大小 (VCD 原始 CD 扇区 2352), 用于 SCR 推进
    pub sector_transport_size: usize,
    /// 分段前缀扇区数 (VCD 30)
    pub transport_prefix_sectors: u32,
    /// VCD 音频扇区尾部零填充字节数
    pub vcd_zero_stuffing: usize,
    pub buffers_in_video: bool,
    pub always_buffers_in_video: bool,
    pub buffers_in_audio: bool,
    pub always_buffers_in_audio: bool,
    /// 视频缓冲记录只在 I 帧分组写出
    pub video_buffers_iframe_only: bool,
    /// 视频时间戳只在 I 帧分组写出
    pub timestamp_iframe_only: bool,
    /// 每个视频 AU 都需要独立时间戳 (静止图像)
    pub dtspts_for_all_vau: bool,
    /// I 帧必须从扇区起点开始
    pub sector_align_iframe_aus: bool,
    /// 分段以视频扇区开始
    pub seg_starts_with_video: bool,
    /// 视频解码缓冲 (字节)
    pub video_buffer_size: u32,
    /// 单文件最大字节数, 0 不限
    pub max_segment_size: u64,
    pub multifile_segment: bool,
    /// 在 I 帧前写出 DVD 导航扇区
    pub gop_control_packets: bool,
}

/// MPEG 音频解码缓冲
pub const AUDIO_BUFFER_SIZE: u32 = 4096;
/// AC-3 解码缓冲
pub const AC3_BUFFER_SIZE: u32 = 16 * 1024;
/// LPCM 解码缓冲
pub const LPCM_BUFFER_SIZE: u32 = 58 * 1024;

impl SyntaxParams {
    /// 解析配置为语法参数
    pub fn resolve(config: &MuxConfig) -> MuxResult<Self> {
        let format = config.format;
        let user_rate = config.data_rate_kbps.saturating_mul(1000) / 8;
        let mut p = SyntaxParams {
            format,
            mpeg: format.mpeg_version(),
            data_rate: user_rate,
            vbr: config.vbr,
            packets_per_pack: 1,
            sys_header_in_pack1: true,
            always_sys_header_in_pack: config.always_sys_header,
            sector_size: 2048,
            sector_transport_size: 2048,
            transport_prefix_sectors: 0,
            vcd_zero_stuffing: 0,
            buffers_in_video: true,
            always_buffers_in_video: true,
            buffers_in_audio: true,
            always_buffers_in_audio: true,
            video_buffers_iframe_only: false,
            timestamp_iframe_only: false,
            dtspts_for_all_vau: false,
            sector_align_iframe_aus: false,
            seg_starts_with_video: false,
            video_buffer_size: 46 * 1024,
            max_segment_size: config.max_segment_size,
            multifile_segment: config.multifile_segment,
            gop_control_packets: false,
        };

        match format {
            MuxFormat::GenericMpeg1 => {
                p.packets_per_pack = config.packets_per_pack.unwrap_or(20);
                p.sector_size = config.sector_size.unwrap_or(2048);
                p.sector_transport_size = p.sector_size;
            }
            MuxFormat::GenericMpeg2 => {
                p.packets_per_pack = config.packets_per_pack.unwrap_or(1);
                p.sector_size = config.sector_size.unwrap_or(2048);
                p.sector_transport_size = p.sector_size;
                p.video_buffer_size = 234 * 1024;
            }
            MuxFormat::Vcd | MuxFormat::VcdNsr | MuxFormat::VcdStill => {
                if format == MuxFormat::Vcd {
                    // 75 个原始 CD 扇区/秒
                    p.data_rate = 75 * 2352;
                    p.vbr = false;
                }
                p.sys_header_in_pack1 = false;
                p.always_sys_header_in_pack = false;
                p.sector_size = 2324;
                p.sector_transport_size = 2352;
                p.transport_prefix_sectors = 30;
                p.vcd_zero_stuffing = 20;
                p.always_buffers_in_video = false;
                p.always_buffers_in_audio = false;
                p.seg_starts_with_video = true;
            }
            MuxFormat::Svcd | MuxFormat::SvcdNsr | MuxFormat::SvcdStill => {
                if format == MuxFormat::Svcd {
                    p.data_rate = 150 * 2324;
                }
                p.vbr = p.vbr || format != MuxFormat::SvcdStill;
                p.sys_header_in_pack1 = false;
                p.always_sys_header_in_pack = false;
                p.sector_size = 2324;
                p.sector_transport_size = 2324;
                p.always_buffers_in_video = false;
                p.sector_align_iframe_aus = true;
                p.seg_starts_with_video = true;
                p.video_buffer_size = 230 * 1024;
            }
            MuxFormat::Dvd => {
                if user_rate == 0 {
                    p.data_rate = 1_260_000;
                }
                p.vbr = true;
                p.sys_header_in_pack1 = false;
                p.always_sys_header_in_pack = false;
                p.always_buffers_in_video = false;
                p.always_buffers_in_audio = false;
                p.video_buffers_iframe_only = true;
                p.timestamp_iframe_only = true;
                p.sector_align_iframe_aus = true;
                p.seg_starts_with_video = true;
                p.video_buffer_size = 232 * 1024;
                p.gop_control_packets = true;
                if p.max_segment_size == 0 {
                    p.max_segment_size = 1 << 30;
                }
            }
        }

        if format.is_stills() {
            p.dtspts_for_all_vau = true;
            p.always_buffers_in_video = true;
            p.sector_align_iframe_aus = true;
            p.video_buffer_size = if format.is_vcd() { 46 } else { 230 } * 1024;
        }

        if let Some(kb) = config.video_buffer_kb {
            p.video_buffer_size = kb.saturating_mul(1024);
        }

        if !format.is_generic() && (config.sector_size.is_some() || config.packets_per_pack.is_some())
        {
            log::warn!("格式 {} 的扇区大小与每包分组数固定, 忽略用户设置", format);
        }
        if !(256..=16384).contains(&p.sector_size) {
            return Err(MuxError::Config(format!(
                "扇区大小 {} 超出 256..=16384",
                p.sector_size
            )));
        }
        if p.packets_per_pack == 0 {
            return Err(MuxError::Config("每包分组数必须 >= 1".into()));
        }

        Ok(p)
    }

    /// 码率是否由基本流自动计算
    pub fn auto_data_rate(&self) -> bool {
        self.data_rate == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_str() {
        assert_eq!("vcd".parse::<MuxFormat>().unwrap(), MuxFormat::Vcd);
        assert_eq!("8".parse::<MuxFormat>().unwrap(), MuxFormat::Dvd);
        assert_eq!(" MPEG2 ".parse::<MuxFormat>().unwrap(), MuxFormat::GenericMpeg2);
        assert!("9".parse::<MuxFormat>().is_err());
        assert!("betamax".parse::<MuxFormat>().is_err());
        for f in MuxFormat::ALL {
            assert_eq!(f.to_string().parse::<MuxFormat>().unwrap(), f);
        }
    }

    #[test]
    fn test_vcd_params() {
        let cfg = MuxConfig {
            format: MuxFormat::Vcd,
            vbr: true,
            ..Default::default()
        };
        let p = SyntaxParams::resolve(&cfg).unwrap();
        assert_eq!(p.mpeg, 1);
        assert_eq!(p.data_rate, 176_400);
        assert!(!p.vbr);
        assert_eq!(p.sector_size, 2324);
        assert_eq!(p.sector_transport_size, 2352);
        assert_eq!(p.transport_prefix_sectors, 30);
        assert_eq!(p.vcd_zero_stuffing, 20);
        assert!(p.seg_starts_with_video);
    }

    #[test]
    fn test_dvd_params() {
        let p = SyntaxParams::resolve(&MuxConfig {
            format: MuxFormat::Dvd,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(p.mpeg, 2);
        assert_eq!(p.sector_size, 2048);
        assert_eq!(p.data_rate, 1_260_000);
        assert_eq!(p.max_segment_size, 1 << 30);
        assert!(p.gop_control_packets);
        assert!(p.video_buffers_iframe_only);
        assert_eq!(p.video_buffer_size, 232 * 1024);
    }

    #[test]
    fn test_generic_overrides() {
        let p = SyntaxParams::resolve(&MuxConfig {
            format: MuxFormat::GenericMpeg1,
            sector_size: Some(2324),
            video_buffer_kb: Some(40),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(p.packets_per_pack, 20);
        assert_eq!(p.sector_size, 2324);
        assert_eq!(p.sector_transport_size, 2324);
        assert_eq!(p.video_buffer_size, 40 * 1024);
        assert!(p.auto_data_rate());

        let bad = MuxConfig {
            sector_size: Some(100),
            ..Default::default()
        };
        assert!(matches!(SyntaxParams::resolve(&bad), Err(MuxError::Config(_))));
    }

    #[test]
    fn test_config_json_defaults() {
        let cfg = MuxConfig::from_json(r#"{"format":"svcd","data_rate_kbps":2500}"#).unwrap();
        assert_eq!(cfg.format, MuxFormat::Svcd);
        assert_eq!(cfg.data_rate_kbps, 2500);
        assert!(!cfg.ignore_underruns);
        let back = MuxConfig::from_json(&cfg.to_json().unwrap()).unwrap();
        assert_eq!(back, cfg);
        assert!(MuxConfig::from_json("{").is_err());
    }
}
