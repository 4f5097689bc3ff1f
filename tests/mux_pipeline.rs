//! 通用 MPEG-1/2 格式的端到端复用测试.

mod common;

use common::*;
use tao_mplex::core::MuxError;
use tao_mplex::core::timestamp::bytes_to_ticks;
use tao_mplex::mux::inspect::{parse_pack_header, walk_sector};
use tao_mplex::mux::{
    FileSink, MemorySink, MuxConfig, MuxFormat, MuxSummary, Multiplexor, StreamInput,
};

const SECTOR: usize = 2324;

fn generic_mpeg1() -> MuxConfig {
    MuxConfig {
        format: MuxFormat::GenericMpeg1,
        sector_size: Some(SECTOR),
        ..Default::default()
    }
}

fn run_memory(config: MuxConfig, inputs: Vec<StreamInput>) -> (MuxSummary, u32, Vec<Vec<u8>>) {
    let mut mux = Multiplexor::new(config, inputs, MemorySink::new()).unwrap();
    let summary = mux.multiplex().unwrap();
    let rate = mux.data_rate();
    (summary, rate, mux.into_sink().into_segments())
}

fn stream_ids(sector: &[u8]) -> Vec<u8> {
    walk_sector(sector)
        .unwrap()
        .iter()
        .map(|u| u.stream_id)
        .collect()
}

#[test]
fn test_video_audio_generic_mpeg1() {
    init_logging();
    let inputs = || {
        vec![
            video_input(mpeg1_video(3, 4000)),
            mpa_input(mpa_layer2(10)),
        ]
    };
    let (summary, rate, segments) = run_memory(generic_mpeg1(), inputs());
    assert_eq!(summary.underruns, 0);
    assert_eq!(summary.segments, 1);
    assert_eq!(segments.len(), 1);
    assert_eq!(rate, summary.mux_rate * 50);

    let data = &segments[0];
    assert_eq!(data.len() as u64, summary.bytes_written);
    let secs = sectors(data, SECTOR);
    assert_eq!(secs.len() as u64, summary.sectors);

    // 首个扇区: Pack 头 + 系统头
    assert_eq!(&stream_ids(secs[0])[..2], &[0xBA, 0xBB]);

    let mut seen_video = false;
    let mut seen_audio = false;
    for (i, sector) in secs.iter().enumerate() {
        let ids = stream_ids(sector);
        seen_video |= ids.contains(&0xE0);
        seen_audio |= ids.contains(&0xC0);
        if ids.first() == Some(&0xBA) {
            // CBR: SCR 完全由已输出字节数决定, MPEG-1 只保留 90kHz 部分
            let pack = parse_pack_header(sector).unwrap();
            let expected = bytes_to_ticks((i * SECTOR) as u64, rate) / 300 * 300;
            assert_eq!(pack.scr, expected, "扇区 {i} 的 SCR");
            assert_eq!(pack.mux_rate, summary.mux_rate);
        }
    }
    assert!(seen_video && seen_audio);

    let last = stream_ids(secs[secs.len() - 1]);
    assert_eq!(last.last(), Some(&0xB9));

    // 相同输入产生逐字节相同的输出
    let (_, _, again) = run_memory(generic_mpeg1(), inputs());
    assert_eq!(segments, again);
}

#[test]
fn test_packs_follow_packets_per_pack() {
    let config = MuxConfig {
        packets_per_pack: Some(4),
        ..generic_mpeg1()
    };
    let (summary, _, segments) = run_memory(
        config,
        vec![
            video_input(mpeg1_video(3, 4000)),
            mpa_input(mpa_layer2(10)),
        ],
    );
    let secs = sectors(&segments[0], SECTOR);
    // 最后一个扇区是独立成包的结束扇区
    for (i, sector) in secs[..secs.len() - 1].iter().enumerate() {
        assert_eq!(
            stream_ids(sector).first() == Some(&0xBA),
            i % 4 == 0,
            "扇区 {i}"
        );
    }
    assert_eq!(summary.underruns, 0);
}

#[test]
fn test_vbr_generic_mpeg2_scr_increases() {
    let config = MuxConfig {
        format: MuxFormat::GenericMpeg2,
        vbr: true,
        ..Default::default()
    };
    let (summary, _, segments) = run_memory(
        config,
        vec![
            video_input(mpeg1_video(6, 3000)),
            mpa_input(mpa_layer2(12)),
        ],
    );
    assert_eq!(summary.underruns, 0);
    let secs = sectors(&segments[0], 2048);
    let scrs: Vec<i64> = secs
        .iter()
        .map(|s| {
            let pack = parse_pack_header(s).unwrap();
            assert_eq!(pack.mpeg_version, 2);
            pack.scr
        })
        .collect();
    assert_eq!(scrs[0], 0);
    assert!(scrs.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_sequence_splice_opens_new_file() {
    init_logging();
    let mut video = mpeg1_sequence(3, 4000);
    video.extend(SEQUENCE_END);
    video.extend(mpeg1_sequence(3, 4000));
    video.extend(SEQUENCE_END);
    let config = MuxConfig {
        multifile_segment: true,
        ..generic_mpeg1()
    };
    let (summary, _, segments) = run_memory(
        config,
        vec![video_input(video), mpa_input(mpa_layer2(16))],
    );
    assert_eq!(summary.underruns, 0);
    assert_eq!(summary.segments, 2);
    assert_eq!(segments.len(), 2);
    for seg in &segments {
        let secs = sectors(seg, SECTOR);
        // 每个文件的时钟从 0 重新开始
        assert_eq!(parse_pack_header(secs[0]).unwrap().scr, 0);
        assert_eq!(&stream_ids(secs[0])[..2], &[0xBA, 0xBB]);
        assert!(secs.iter().any(|s| stream_ids(s).contains(&0xE0)));
        assert_eq!(stream_ids(secs[secs.len() - 1]).last(), Some(&0xB9));
    }
}

#[test]
fn test_sequence_splice_without_multifile_stays_in_one_file() {
    let mut video = mpeg1_sequence(3, 4000);
    video.extend(SEQUENCE_END);
    video.extend(mpeg1_sequence(3, 4000));
    video.extend(SEQUENCE_END);
    let (summary, _, segments) = run_memory(
        generic_mpeg1(),
        vec![video_input(video), mpa_input(mpa_layer2(16))],
    );
    assert_eq!(summary.segments, 2);
    assert_eq!(segments.len(), 1);
    let secs = sectors(&segments[0], SECTOR);
    let resets = secs
        .iter()
        .filter(|s| stream_ids(s).first() == Some(&0xBA))
        .filter(|s| parse_pack_header(s).unwrap().scr == 0)
        .count();
    assert_eq!(resets, 2);
}

#[test]
fn test_size_limit_splits_audio_only_output() {
    let config = MuxConfig {
        max_segment_size: 10 * 2048,
        ..Default::default()
    };
    let (summary, _, segments) = run_memory(config, vec![mpa_input(mpa_layer2(60))]);
    assert!(summary.segments >= 2);
    assert_eq!(segments.len() as u32, summary.segments);
    assert_eq!(summary.underruns, 0);
    for seg in &segments {
        let secs = sectors(seg, 2048);
        assert_eq!(parse_pack_header(secs[0]).unwrap().scr, 0);
        assert_eq!(stream_ids(secs[secs.len() - 1]).last(), Some(&0xB9));
    }
}

#[test]
fn test_file_sink_output() {
    let dir = tempfile::tempdir().unwrap();
    let template = dir.path().join("out.mpg");
    let sink = FileSink::create(template.to_str().unwrap()).unwrap();
    let mut mux = Multiplexor::new(
        generic_mpeg1(),
        vec![
            video_input(mpeg1_video(3, 4000)),
            mpa_input(mpa_layer2(10)),
        ],
        sink,
    )
    .unwrap();
    let summary = mux.multiplex().unwrap();
    let paths = mux.sink().paths().to_vec();
    assert_eq!(paths, vec![template.clone()]);
    let written = std::fs::read(&template).unwrap();
    assert_eq!(written.len() as u64, summary.bytes_written);
    assert_eq!(written.len() % SECTOR, 0);
}

#[test]
fn test_private_stream_rejected_in_mpeg1() {
    let err = Multiplexor::new(
        generic_mpeg1(),
        vec![lpcm_input(lpcm(100))],
        MemorySink::new(),
    );
    assert!(err.is_err());
}

/// 序列头码率字段为 0x3FFFF 的可变码率视频
fn vbr_video(frames: usize) -> Vec<u8> {
    let mut data = sequence_header(3, 0x3FFFF);
    data.extend(gop_header());
    for i in 0..frames {
        data.extend(picture(i as u32, if i == 0 { 1 } else { 2 }, 4000));
    }
    data.extend(SEQUENCE_END);
    data
}

#[test]
fn test_vbr_video_requires_data_rate() {
    let result = Multiplexor::new(
        generic_mpeg1(),
        vec![video_input(vbr_video(3)), mpa_input(mpa_layer2(10))],
        MemorySink::new(),
    );
    assert!(matches!(result, Err(MuxError::Config(_))));

    let config = MuxConfig {
        data_rate_kbps: 1800,
        ..generic_mpeg1()
    };
    let (summary, rate, segments) = run_memory(
        config,
        vec![video_input(vbr_video(3)), mpa_input(mpa_layer2(10))],
    );
    assert_eq!(rate, 225_000);
    assert_eq!(summary.mux_rate, 4500);
    assert!(!segments[0].is_empty());
}
