//! MPEG-1/2 视频访问单元扫描.
//!
//! 按起始码切分 AU: 图像数据之后遇到的第一个序列头、GOP 头或图像头开始下一个 AU.
//! 时间戳以场为单位累计, 最后按帧率换算为 27MHz 刻度.
//! 序列结束码之后紧跟序列头视为拼接, 否则视为流结束.

use mplex_core::{BitReader, ClockTicks, FrameRate, MuxError, MuxResult};

use crate::au::{AccessUnit, FrameType};

/// 起始码前缀 0x000001
pub const START_CODE_PREFIX: u32 = 0x00_0001;
pub const PICTURE_START: u8 = 0x00;
pub const SEQUENCE_HEADER: u8 = 0xB3;
pub const EXTENSION_START: u8 = 0xB5;
pub const SEQUENCE_END: u8 = 0xB7;
pub const GOP_START: u8 = 0xB8;

const SEQUENCE_EXT_ID: u32 = 1;
const PICTURE_CODING_EXT_ID: u32 = 8;
/// picture_structure: 帧图像
const PIC_FRAME: u32 = 3;
/// 码率字段全 1 表示可变码率
const VBR_BITRATE_CODE: u32 = 0x3FFFF;
/// 序列头到序列扩展之间最多隔着两张量化矩阵
const SEQ_EXT_SEARCH_BYTES: u64 = 256;
const PIC_EXT_SEARCH_BYTES: u64 = 64;

/// 序列头参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceInfo {
    pub width: u32,
    pub height: u32,
    pub aspect_code: u8,
    pub frame_rate: FrameRate,
    /// 码率 (bit/s), 0 表示可变码率
    pub bit_rate: u32,
    /// VBV 缓冲大小 (字节)
    pub vbv_buffer_size: u32,
    pub mpeg2: bool,
}

/// 解析序列头字段 (游标位于 0xB3 起始码之后)
fn parse_sequence_header(reader: &mut BitReader) -> MuxResult<SequenceInfo> {
    let width = reader.read_bits(12)?;
    let height = reader.read_bits(12)?;
    let aspect_code = reader.read_bits(4)? as u8;
    let rate_code = reader.read_bits(4)?;
    let bit_rate_code = reader.read_bits(18)?;
    reader.read_bit()?;
    let vbv = reader.read_bits(10)?;
    if reader.eos() {
        return Err(MuxError::InvalidData("视频序列头被截断".into()));
    }
    let frame_rate = FrameRate::from_mpeg_code(rate_code).ok_or_else(|| {
        MuxError::InvalidData(format!("视频帧率代码 {} 无效", rate_code))
    })?;
    let bit_rate = if bit_rate_code == VBR_BITRATE_CODE {
        0
    } else {
        bit_rate_code * 400
    };
    Ok(SequenceInfo {
        width,
        height,
        aspect_code,
        frame_rate,
        bit_rate,
        vbv_buffer_size: vbv * 2048,
        mpeg2: false,
    })
}

/// 序列头之后是否紧跟序列扩展 (MPEG-2)
fn detect_mpeg2(reader: &mut BitReader) -> MuxResult<bool> {
    if !reader.seek_sync(START_CODE_PREFIX, 24, SEQ_EXT_SEARCH_BYTES)? {
        return Ok(false);
    }
    Ok(reader.read_bits(8)? == u32::from(EXTENSION_START)
        && reader.read_bits(4)? == SEQUENCE_EXT_ID)
}

#[derive(Debug, Clone, Copy)]
struct PictureInfo {
    temporal_ref: u32,
    frame_type: FrameType,
    structure: u32,
    repeat_first_field: bool,
}

/// 解析图像头及可选的图像编码扩展 (游标位于 0x00 起始码之后)
fn parse_picture_header(reader: &mut BitReader) -> MuxResult<PictureInfo> {
    let temporal_ref = reader.read_bits(10)?;
    let coding_type = reader.read_bits(3)?;
    let frame_type = FrameType::from_coding_type(coding_type).ok_or_else(|| {
        MuxError::InvalidData(format!("图像编码类型 {} 无效", coding_type))
    })?;
    let mut pic = PictureInfo {
        temporal_ref,
        frame_type,
        structure: PIC_FRAME,
        repeat_first_field: false,
    };

    let cp = reader.checkpoint();
    let has_ext = reader.seek_sync(START_CODE_PREFIX, 24, PIC_EXT_SEARCH_BYTES)?
        && reader.read_bits(8)? == u32::from(EXTENSION_START)
        && reader.read_bits(4)? == PICTURE_CODING_EXT_ID;
    if has_ext {
        // f_code[4] + intra_dc_precision
        reader.skip_bits(16 + 2)?;
        pic.structure = reader.read_bits(2)?;
        // top_field_first .. alternate_scan
        reader.skip_bits(6)?;
        pic.repeat_first_field = reader.read_bit()?;
    } else {
        reader.restore(&cp)?;
    }
    Ok(pic)
}

/// 找到下一个起始码, 返回 (起始码位置, 后缀); 流结束返回 None
fn next_start_code(reader: &mut BitReader) -> MuxResult<Option<(u64, u8)>> {
    if !reader.seek_sync(START_CODE_PREFIX, 24, u64::MAX)? {
        return Ok(None);
    }
    let at = reader.bit_position() - 24;
    let code = reader.read_bits(8)? as u8;
    if reader.eos() {
        return Ok(None);
    }
    Ok(Some((at, code)))
}

/// MPEG 视频扫描器
#[derive(Debug, Clone)]
pub struct VideoScanner {
    info: SequenceInfo,
    /// 下一个 AU 的首个起始码, 游标位于其后
    pending: Option<(u64, u8)>,
    decode_index: u64,
    /// 已解码图像累计的场数
    fields_decoded: i64,
    group_start_field: i64,
    group_start_pic: u64,
    /// 上一张图像之后出现过 GOP 头或序列头
    group_pending: bool,
    seen_gop: bool,
    /// 出现过 repeat_first_field, 按 3:2 下拉计算 PTS
    pulldown: bool,
    /// 场图像的第一场: (temporal_reference, PTS 场数)
    first_field: Option<(u32, i64)>,
}

impl VideoScanner {
    /// 解析首个序列头并判断 MPEG 版本; 游标保持在序列头起始码之后
    pub fn init(reader: &mut BitReader) -> MuxResult<Self> {
        let code = reader.read_bits(32)?;
        if reader.eos() || code != (START_CODE_PREFIX << 8) | u32::from(SEQUENCE_HEADER) {
            return Err(MuxError::InvalidData("视频流必须以序列头开始".into()));
        }
        let cp = reader.checkpoint();
        let mut info = parse_sequence_header(reader)?;
        info.mpeg2 = detect_mpeg2(reader)?;
        reader.restore(&cp)?;
        log::debug!(
            "MPEG-{} 视频: {}x{}, {} fps, {} bit/s, VBV {} 字节",
            if info.mpeg2 { 2 } else { 1 },
            info.width,
            info.height,
            info.frame_rate,
            info.bit_rate,
            info.vbv_buffer_size
        );
        Ok(Self {
            info,
            pending: Some((0, SEQUENCE_HEADER)),
            decode_index: 0,
            fields_decoded: 0,
            group_start_field: 0,
            group_start_pic: 0,
            group_pending: true,
            seen_gop: false,
            pulldown: false,
            first_field: None,
        })
    }

    pub fn info(&self) -> &SequenceInfo {
        &self.info
    }

    pub fn nominal_bit_rate(&self) -> u32 {
        self.info.bit_rate
    }

    /// 扫描下一个 AU
    pub fn next_au(&mut self, reader: &mut BitReader) -> MuxResult<Option<AccessUnit>> {
        let Some((start, first_code)) = self.pending.take() else {
            return Ok(None);
        };
        let mut code_at = start;
        let mut code = first_code;
        let mut seq_header = false;
        let mut picture: Option<PictureInfo> = None;

        loop {
            if let Some(pic) = picture {
                if matches!(code, SEQUENCE_HEADER | GOP_START | PICTURE_START) {
                    self.pending = Some((code_at, code));
                    return Ok(Some(self.finish_au(start, code_at, seq_header, pic, false)));
                }
            }
            match code {
                SEQUENCE_HEADER => {
                    let seq = parse_sequence_header(reader)?;
                    if seq.frame_rate != self.info.frame_rate {
                        log::warn!(
                            "视频帧率在字节 {} 处由 {} 变为 {}, 继续使用 {}",
                            code_at / 8,
                            self.info.frame_rate,
                            seq.frame_rate,
                            self.info.frame_rate
                        );
                    }
                    seq_header = true;
                    self.group_pending = true;
                }
                GOP_START => {
                    self.seen_gop = true;
                    self.group_pending = true;
                }
                PICTURE_START => picture = Some(parse_picture_header(reader)?),
                SEQUENCE_END => {
                    let end = reader.bit_position();
                    let pic = picture.ok_or_else(|| {
                        MuxError::InvalidData(format!(
                            "字节 {} 处的序列结束码之前没有图像",
                            code_at / 8
                        ))
                    })?;
                    self.after_sequence_end(reader, end)?;
                    return Ok(Some(self.finish_au(start, end, seq_header, pic, true)));
                }
                _ => {}
            }

            match next_start_code(reader)? {
                Some((at, c)) => {
                    code_at = at;
                    code = c;
                }
                None => {
                    let end = reader.bit_position();
                    return match picture {
                        Some(pic) => {
                            log::warn!("视频流缺少序列结束码, 在字节 {} 处结束", end / 8);
                            Ok(Some(self.finish_au(start, end, seq_header, pic, false)))
                        }
                        None => {
                            log::warn!(
                                "视频流末尾 {} 字节不含图像, 已丢弃",
                                end.saturating_sub(start) / 8
                            );
                            Ok(None)
                        }
                    };
                }
            }
        }
    }

    /// 序列结束码之后: 紧跟序列头则拼接, 否则流结束
    fn after_sequence_end(&mut self, reader: &mut BitReader, end: u64) -> MuxResult<()> {
        let next = reader.peek_bits(32)?;
        if next == (START_CODE_PREFIX << 8) | u32::from(SEQUENCE_HEADER) {
            reader.read_bits(32)?;
            self.pending = Some((end, SEQUENCE_HEADER));
            log::debug!("视频序列在字节 {} 处拼接", end / 8);
        } else if !reader.at_end()? {
            log::warn!("视频序列结束码 (字节 {}) 之后的数据被忽略", end / 8);
        }
        Ok(())
    }

    /// 计算时间戳并生成 AU
    fn finish_au(
        &mut self,
        start: u64,
        end: u64,
        seq_header: bool,
        pic: PictureInfo,
        end_seq: bool,
    ) -> AccessUnit {
        if self.group_pending || (!self.seen_gop && pic.frame_type == FrameType::I) {
            self.group_start_field = self.fields_decoded;
            self.group_start_pic = self.decode_index;
            self.group_pending = false;
        }
        if pic.repeat_first_field {
            self.pulldown = true;
        }

        let dts_fields = self.fields_decoded;
        let tr = i64::from(pic.temporal_ref);
        let frame_pts = if self.pulldown {
            self.group_start_field + 2 * ((tr + 1) / 2) + 3 * (tr / 2) + 2
        } else {
            self.group_start_field + 2 * tr + 2
        };

        let pts_fields = if pic.structure != PIC_FRAME {
            self.fields_decoded += 1;
            match self.first_field.take() {
                Some((first_tr, first_pts)) if first_tr == pic.temporal_ref => first_pts + 1,
                _ => {
                    self.first_field = Some((pic.temporal_ref, frame_pts));
                    frame_pts
                }
            }
        } else {
            self.first_field = None;
            self.fields_decoded += if pic.repeat_first_field { 3 } else { 2 };
            frame_pts
        };

        let rate = self.info.frame_rate;
        let au = AccessUnit {
            start,
            length: ((end - start) / 8) as u32,
            pts: rate.fields_to_ticks(pts_fields),
            dts: rate.fields_to_ticks(dts_fields),
            dorder: self.decode_index,
            porder: self.group_start_pic + u64::from(pic.temporal_ref),
            frame_type: pic.frame_type,
            seq_header,
            end_seq,
        };
        log::trace!(
            "视频 AU #{}: {:?} 长度 {} DTS {} PTS {}",
            au.dorder,
            au.frame_type,
            au.length,
            au.dts,
            au.pts
        );
        self.decode_index += 1;
        au
    }

    /// 单场时长
    pub fn field_ticks(&self) -> ClockTicks {
        self.info.frame_rate.fields_to_ticks(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mplex_core::BitWriter;
    use std::io::Cursor;

    fn seq_header(rate_code: u32, bit_rate: u32) -> Vec<u8> {
        let mut b = [0u8; 12];
        let mut w = BitWriter::new(&mut b);
        w.write_u32(0x0000_01B3).unwrap();
        w.write_bits(352, 12).unwrap();
        w.write_bits(288, 12).unwrap();
        w.write_bits(1, 4).unwrap();
        w.write_bits(rate_code, 4).unwrap();
        w.write_bits(bit_rate, 18).unwrap();
        w.write_bit(true).unwrap();
        w.write_bits(20, 10).unwrap();
        w.write_bits(0, 3).unwrap();
        b.to_vec()
    }

    fn seq_ext() -> Vec<u8> {
        vec![0x00, 0x00, 0x01, 0xB5, 0x14, 0x8A, 0x00, 0x01, 0x80, 0x00]
    }

    fn gop() -> Vec<u8> {
        vec![0x00, 0x00, 0x01, 0xB8, 0x00, 0x08, 0x00, 0x40]
    }

    fn picture(tr: u32, coding_type: u32) -> Vec<u8> {
        let mut b = [0u8; 8];
        let mut w = BitWriter::new(&mut b);
        w.write_u32(0x0000_0100).unwrap();
        w.write_bits(tr, 10).unwrap();
        w.write_bits(coding_type, 3).unwrap();
        w.write_bits(0xFFFF, 16).unwrap();
        b.to_vec()
    }

    fn picture_ext(structure: u32, rff: bool) -> Vec<u8> {
        let mut b = [0u8; 9];
        let mut w = BitWriter::new(&mut b);
        w.write_u32(0x0000_01B5).unwrap();
        w.write_bits(PICTURE_CODING_EXT_ID, 4).unwrap();
        w.write_bits(0xFFFF, 16).unwrap();
        w.write_bits(0, 2).unwrap();
        w.write_bits(structure, 2).unwrap();
        w.write_bits(0b100000, 6).unwrap();
        w.write_bit(rff).unwrap();
        w.write_bits(0b110, 3).unwrap();
        b.to_vec()
    }

    fn slice(n: usize) -> Vec<u8> {
        let mut s = vec![0x00, 0x00, 0x01, 0x01];
        s.extend(std::iter::repeat_n(0x55, n));
        s
    }

    const END: [u8; 4] = [0x00, 0x00, 0x01, 0xB7];

    fn scan_all(data: Vec<u8>) -> (VideoScanner, Vec<AccessUnit>) {
        let mut reader = BitReader::new(Cursor::new(data));
        let mut sc = VideoScanner::init(&mut reader).unwrap();
        let mut aus = Vec::new();
        while let Some(au) = sc.next_au(&mut reader).unwrap() {
            aus.push(au);
        }
        (sc, aus)
    }

    #[test]
    fn test_gop_timestamps_in_fields() {
        let mut data = seq_header(3, 2875);
        data.extend(gop());
        for (tr, ty) in [(2, 1), (0, 3), (1, 3), (5, 2), (3, 3), (4, 3)] {
            data.extend(picture(tr, ty));
            data.extend(slice(100));
        }
        data.extend(END);
        let (sc, aus) = scan_all(data);

        assert!(!sc.info().mpeg2);
        assert_eq!(sc.nominal_bit_rate(), 2875 * 400);
        assert_eq!(sc.info().vbv_buffer_size, 20 * 2048);
        assert_eq!(sc.info().frame_rate, FrameRate::new(25, 1));

        let field = sc.field_ticks();
        assert_eq!(field, 540_000);
        let got: Vec<(i64, i64)> = aus.iter().map(|a| (a.dts / field, a.pts / field)).collect();
        assert_eq!(got, vec![(0, 6), (2, 2), (4, 4), (6, 12), (8, 8), (10, 10)]);

        assert_eq!(aus[0].length, 12 + 8 + 8 + 104);
        assert!(aus[0].seq_header);
        assert_eq!(aus[0].frame_type, FrameType::I);
        assert_eq!(aus[1].start_byte(), 132);
        assert_eq!(aus[1].length, 112);
        assert_eq!(aus[5].length, 116);
        assert!(aus[5].end_seq);
        assert_eq!(aus[3].porder, 5);
        assert!(aus.iter().map(|a| a.dorder).eq(0..6));
    }

    #[test]
    fn test_mpeg2_repeat_first_field() {
        let mut data = seq_header(4, VBR_BITRATE_CODE);
        data.extend(seq_ext());
        data.extend(picture(0, 1));
        data.extend(picture_ext(PIC_FRAME, true));
        data.extend(slice(50));
        data.extend(picture(1, 2));
        data.extend(picture_ext(PIC_FRAME, false));
        data.extend(slice(50));
        data.extend(picture(2, 2));
        data.extend(picture_ext(PIC_FRAME, false));
        data.extend(slice(50));
        data.extend(END);
        let (sc, aus) = scan_all(data);
        assert!(sc.info().mpeg2);
        assert_eq!(sc.nominal_bit_rate(), 0);
        let field = FrameRate::new(30000, 1001);
        let fields = |a: &AccessUnit| {
            (
                (0..20).find(|&f| field.fields_to_ticks(f) == a.dts),
                (0..20).find(|&f| field.fields_to_ticks(f) == a.pts),
            )
        };
        assert_eq!(fields(&aus[0]), (Some(0), Some(2)));
        assert_eq!(fields(&aus[1]), (Some(3), Some(4)));
        assert_eq!(fields(&aus[2]), (Some(5), Some(7)));
    }

    #[test]
    fn test_field_pictures_pair() {
        let mut data = seq_header(3, 5000);
        data.extend(seq_ext());
        data.extend(gop());
        data.extend(picture(0, 1));
        data.extend(picture_ext(1, false));
        data.extend(slice(30));
        data.extend(picture(0, 2));
        data.extend(picture_ext(2, false));
        data.extend(slice(30));
        data.extend(picture(1, 2));
        data.extend(picture_ext(PIC_FRAME, false));
        data.extend(slice(30));
        data.extend(END);
        let (sc, aus) = scan_all(data);
        let field = sc.field_ticks();
        let got: Vec<(i64, i64)> = aus.iter().map(|a| (a.dts / field, a.pts / field)).collect();
        assert_eq!(got, vec![(0, 2), (1, 3), (2, 4)]);
    }

    #[test]
    fn test_sequence_splice() {
        let mut data = seq_header(3, 2875);
        data.extend(picture(0, 1));
        data.extend(slice(20));
        data.extend(END);
        data.extend(seq_header(3, 2875));
        data.extend(picture(0, 1));
        data.extend(slice(20));
        data.extend(END);
        data.extend([0xAA; 7]);
        let (sc, aus) = scan_all(data);
        assert_eq!(aus.len(), 2);
        assert!(aus[0].end_seq);
        assert_eq!(aus[0].length, 12 + 8 + 24 + 4);
        assert!(aus[1].seq_header);
        assert_eq!(aus[1].start_byte(), 48);
        assert_eq!(aus[1].frame_type, FrameType::I);
        let field = sc.field_ticks();
        assert_eq!((aus[1].dts / field, aus[1].pts / field), (2, 4));
    }

    #[test]
    fn test_missing_sequence_end() {
        let mut data = seq_header(3, 2875);
        data.extend(picture(0, 1));
        data.extend(slice(20));
        data.extend(picture(1, 2));
        data.extend(slice(20));
        let (_, aus) = scan_all(data);
        assert_eq!(aus.len(), 2);
        assert!(!aus[1].end_seq);
        assert_eq!(aus[1].length, 8 + 24);
    }

    #[test]
    fn test_must_start_with_sequence_header() {
        let mut data = gop();
        data.extend(seq_header(3, 2875));
        let mut reader = BitReader::new(Cursor::new(data));
        assert!(matches!(
            VideoScanner::init(&mut reader),
            Err(MuxError::InvalidData(_))
        ));
    }
}
