//! 集成测试共用的合成基本流构造器.

#![allow(dead_code)]

use std::io::Cursor;

use tao_mplex::core::BitWriter;
use tao_mplex::mux::{InputKind, StreamInput};

/// 序列结束码
pub const SEQUENCE_END: [u8; 4] = [0x00, 0x00, 0x01, 0xB7];

/// MPEG-1 序列头: 352x288, VBV 20 (40KiB)
pub fn sequence_header(rate_code: u32, bit_rate_400: u32) -> Vec<u8> {
    let mut b = [0u8; 12];
    let mut w = BitWriter::new(&mut b);
    w.write_u32(0x0000_01B3).unwrap();
    w.write_bits(352, 12).unwrap();
    w.write_bits(288, 12).unwrap();
    w.write_bits(1, 4).unwrap();
    w.write_bits(rate_code, 4).unwrap();
    w.write_bits(bit_rate_400, 18).unwrap();
    w.write_bit(true).unwrap();
    w.write_bits(20, 10).unwrap();
    w.write_bits(0, 3).unwrap();
    b.to_vec()
}

/// 闭合 GOP 头, 时间码 0
pub fn gop_header() -> Vec<u8> {
    vec![0x00, 0x00, 0x01, 0xB8, 0x00, 0x08, 0x00, 0x40]
}

/// 图像头 + 单个 slice, 总长 `size` 字节
pub fn picture(temporal_ref: u32, coding_type: u32, size: usize) -> Vec<u8> {
    let mut b = vec![0u8; 8];
    let mut w = BitWriter::new(&mut b);
    w.write_u32(0x0000_0100).unwrap();
    w.write_bits(temporal_ref, 10).unwrap();
    w.write_bits(coding_type, 3).unwrap();
    w.write_bits(0xFFFF, 16).unwrap();
    b.extend([0x00, 0x00, 0x01, 0x01]);
    b.resize(size.max(12), 0x55);
    b
}

/// 一个视频序列: 序列头 + GOP + I P P ..., 不带结束码
///
/// 25fps (rate_code 3), 标称码率 1.15Mbit/s.
pub fn mpeg1_sequence(frames: usize, au_size: usize) -> Vec<u8> {
    let mut data = sequence_header(3, 2875);
    data.extend(gop_header());
    for i in 0..frames {
        let coding_type = if i == 0 { 1 } else { 2 };
        data.extend(picture(i as u32, coding_type, au_size));
    }
    data
}

/// 单序列视频流, 以序列结束码收尾
pub fn mpeg1_video(frames: usize, au_size: usize) -> Vec<u8> {
    let mut data = mpeg1_sequence(frames, au_size);
    data.extend(SEQUENCE_END);
    data
}

/// MPEG-1 Layer II, 128kbit/s, 44.1kHz, 每帧 417 字节
pub fn mpa_layer2(frames: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(frames * 417);
    for i in 0..frames {
        let mut f = vec![(i % 200 + 1) as u8; 417];
        f[..4].copy_from_slice(&[0xFF, 0xFD, 0x80, 0x00]);
        data.extend(f);
    }
    data
}

/// AC-3, 48kHz, 32kbit/s, 每帧 128 字节
pub fn ac3_frames(frames: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(frames * 128);
    for _ in 0..frames {
        let mut f = vec![0u8; 128];
        f[0] = 0x0B;
        f[1] = 0x77;
        f[4] = 0x00;
        data.extend(f);
    }
    data
}

/// 48kHz 双声道 16 位 LPCM, `ms` 毫秒
pub fn lpcm(ms: usize) -> Vec<u8> {
    vec![0x11; 48 * 4 * ms]
}

pub fn video_input(data: Vec<u8>) -> StreamInput {
    StreamInput::new(InputKind::MpegVideo, "video.m1v", Cursor::new(data))
}

pub fn mpa_input(data: Vec<u8>) -> StreamInput {
    StreamInput::new(InputKind::MpegAudio, "audio.mp2", Cursor::new(data))
}

pub fn ac3_input(data: Vec<u8>) -> StreamInput {
    StreamInput::new(InputKind::Ac3, "audio.ac3", Cursor::new(data))
}

pub fn lpcm_input(data: Vec<u8>) -> StreamInput {
    StreamInput::new(InputKind::Lpcm, "audio.lpcm", Cursor::new(data))
}

/// 测试日志, 可用 RUST_LOG 控制
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 按扇区切分输出
pub fn sectors(data: &[u8], sector_size: usize) -> Vec<&[u8]> {
    assert_eq!(data.len() % sector_size, 0, "输出不是整扇区");
    data.chunks(sector_size).collect()
}
