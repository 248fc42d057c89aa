//! Uncompressed AVI (RIFF) writer.
//!
//! The file is written front to back. Sizes and frame counts which are only
//! known at the end are patched in [AviWriter::finish].

use std::{
    fs::File,
    io::{BufWriter, Seek, SeekFrom, Write},
    path::Path,
};

use byteorder::{LittleEndian, WriteBytesExt};
use rig_camera::Frame;

use crate::{EncoderSpec, Error, FrameEncoder, RawLayout, Result};

const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;
const BI_RGB: u32 = 0;
const MAIN_HEADER_SIZE: u32 = 56;
const STREAM_HEADER_SIZE: u32 = 56;
const BITMAP_INFO_SIZE: u32 = 40;
const PALETTE_SIZE: u32 = 256 * 4;
const IDX1_ENTRY_SIZE: u64 = 16;
const CHUNK_ID: &[u8; 4] = b"00db";

struct IndexEntry {
    offset: u32,
    size: u32,
}

pub struct AviWriter {
    spec: EncoderSpec,
    layout: RawLayout,
    wtr: Option<BufWriter<File>>,
    stride_out: usize,
    frame_bytes: u32,
    /// Position of the `movi` fourcc. idx1 offsets are relative to it.
    movi_pos: u64,
    pos: u64,
    index: Vec<IndexEntry>,
    total_frames_pos: u64,
    stream_length_pos: u64,
    row_buf: Vec<u8>,
}

fn write_fourcc<W: Write>(w: &mut W, code: &[u8; 4]) -> std::io::Result<()> {
    w.write_all(code)
}

impl AviWriter {
    pub fn create(spec: EncoderSpec, layout: RawLayout) -> Result<Self> {
        let bytes_per_pixel: usize = if spec.is_color { 3 } else { 1 };
        if spec.is_color && layout == RawLayout::Y800 {
            return Err(Error::ColorNotSupported(spec.fourcc));
        }
        if spec.width == 0 || spec.height == 0 {
            return Err(Error::InvalidSetting {
                field: "frame size",
                reason: format!("{}x{}", spec.width, spec.height),
            });
        }
        if !(spec.fps.is_finite() && spec.fps > 0.0) {
            return Err(Error::InvalidSetting {
                field: "fps",
                reason: format!("{} is not a positive number", spec.fps),
            });
        }
        let stride = spec.width as usize * bytes_per_pixel;
        let stride_out = match layout {
            RawLayout::Y800 => stride,
            RawLayout::Dib => stride.div_ceil(4) * 4,
        };
        let frame_bytes = u32::try_from(stride_out * spec.height as usize)
            .map_err(|_| Error::FileTooLarge)?;

        let file = File::create(&spec.path)?;
        let mut me = Self {
            spec,
            layout,
            wtr: Some(BufWriter::new(file)),
            stride_out,
            frame_bytes,
            movi_pos: 0,
            pos: 0,
            index: Vec::new(),
            total_frames_pos: 0,
            stream_length_pos: 0,
            row_buf: vec![0u8; stride_out],
        };
        me.write_headers()?;
        Ok(me)
    }

    fn paletted(&self) -> bool {
        self.layout == RawLayout::Dib && !self.spec.is_color
    }

    fn write_headers(&mut self) -> Result<()> {
        let spec = &self.spec;
        let paletted = self.paletted();
        let strf_size = BITMAP_INFO_SIZE + if paletted { PALETTE_SIZE } else { 0 };
        let strl_size = 4 + (8 + STREAM_HEADER_SIZE) + (8 + strf_size);
        let hdrl_size = 4 + (8 + MAIN_HEADER_SIZE) + (8 + strl_size);
        let usec_per_frame = (1e6 / spec.fps).round() as u32;
        let rate = (spec.fps * 1000.0).round() as u32;
        let bytes_per_sec = (self.frame_bytes as f64 * spec.fps).min(u32::MAX as f64) as u32;
        let (handler, compression, bit_count) = match self.layout {
            RawLayout::Y800 => (*b"Y800", u32::from_le_bytes(*b"Y800"), 8u16),
            RawLayout::Dib => (*b"DIB ", BI_RGB, if spec.is_color { 24 } else { 8 }),
        };
        let frame_bytes = self.frame_bytes;
        let (width, height) = (spec.width, spec.height);

        let w = self.wtr.as_mut().ok_or(Error::AlreadyDone)?;

        write_fourcc(w, b"RIFF")?;
        w.write_u32::<LittleEndian>(0)?; // patched on finish
        write_fourcc(w, b"AVI ")?;

        write_fourcc(w, b"LIST")?;
        w.write_u32::<LittleEndian>(hdrl_size)?;
        write_fourcc(w, b"hdrl")?;

        // MainAVIHeader
        write_fourcc(w, b"avih")?;
        w.write_u32::<LittleEndian>(MAIN_HEADER_SIZE)?;
        w.write_u32::<LittleEndian>(usec_per_frame)?;
        w.write_u32::<LittleEndian>(bytes_per_sec)?;
        w.write_u32::<LittleEndian>(0)?; // padding granularity
        w.write_u32::<LittleEndian>(AVIF_HASINDEX)?;
        let total_frames_pos = 12 + 12 + 8 + 16;
        w.write_u32::<LittleEndian>(0)?; // total frames, patched
        w.write_u32::<LittleEndian>(0)?; // initial frames
        w.write_u32::<LittleEndian>(1)?; // streams
        w.write_u32::<LittleEndian>(frame_bytes)?;
        w.write_u32::<LittleEndian>(width)?;
        w.write_u32::<LittleEndian>(height)?;
        for _ in 0..4 {
            w.write_u32::<LittleEndian>(0)?;
        }

        write_fourcc(w, b"LIST")?;
        w.write_u32::<LittleEndian>(strl_size)?;
        write_fourcc(w, b"strl")?;

        // AVIStreamHeader
        let strh_start: u64 = total_frames_pos + 40 + 12;
        write_fourcc(w, b"strh")?;
        w.write_u32::<LittleEndian>(STREAM_HEADER_SIZE)?;
        write_fourcc(w, b"vids")?;
        write_fourcc(w, &handler)?;
        w.write_u32::<LittleEndian>(0)?; // flags
        w.write_u16::<LittleEndian>(0)?; // priority
        w.write_u16::<LittleEndian>(0)?; // language
        w.write_u32::<LittleEndian>(0)?; // initial frames
        w.write_u32::<LittleEndian>(1000)?; // scale
        w.write_u32::<LittleEndian>(rate)?;
        w.write_u32::<LittleEndian>(0)?; // start
        let stream_length_pos = strh_start + 8 + 32;
        w.write_u32::<LittleEndian>(0)?; // length, patched
        w.write_u32::<LittleEndian>(frame_bytes)?;
        w.write_u32::<LittleEndian>(u32::MAX)?; // quality: default
        w.write_u32::<LittleEndian>(0)?; // sample size
        w.write_i16::<LittleEndian>(0)?;
        w.write_i16::<LittleEndian>(0)?;
        w.write_i16::<LittleEndian>(width.min(i16::MAX as u32) as i16)?;
        w.write_i16::<LittleEndian>(height.min(i16::MAX as u32) as i16)?;

        // BITMAPINFOHEADER
        write_fourcc(w, b"strf")?;
        w.write_u32::<LittleEndian>(strf_size)?;
        w.write_u32::<LittleEndian>(BITMAP_INFO_SIZE)?;
        w.write_i32::<LittleEndian>(width as i32)?;
        w.write_i32::<LittleEndian>(height as i32)?;
        w.write_u16::<LittleEndian>(1)?; // planes
        w.write_u16::<LittleEndian>(bit_count)?;
        w.write_u32::<LittleEndian>(compression)?;
        w.write_u32::<LittleEndian>(frame_bytes)?;
        w.write_i32::<LittleEndian>(0)?;
        w.write_i32::<LittleEndian>(0)?;
        let colors = if paletted { 256 } else { 0 };
        w.write_u32::<LittleEndian>(colors)?;
        w.write_u32::<LittleEndian>(colors)?;
        if paletted {
            for i in 0..=255u8 {
                w.write_all(&[i, i, i, 0])?;
            }
        }

        write_fourcc(w, b"LIST")?;
        w.write_u32::<LittleEndian>(0)?; // movi size, patched
        let movi_pos = 12 + 8 + hdrl_size as u64 + 8;
        write_fourcc(w, b"movi")?;

        self.total_frames_pos = total_frames_pos;
        self.stream_length_pos = stream_length_pos;
        self.movi_pos = movi_pos;
        self.pos = movi_pos + 4;
        Ok(())
    }

    fn projected_size(&self, extra_frames: u64) -> u64 {
        let chunk = 8 + self.frame_bytes as u64 + (self.frame_bytes as u64 % 2);
        let frames = self.index.len() as u64 + extra_frames;
        self.pos + chunk * extra_frames + 8 + IDX1_ENTRY_SIZE * frames
    }

    pub fn frames_written(&self) -> usize {
        self.index.len()
    }
}

impl FrameEncoder for AviWriter {
    fn path(&self) -> &Path {
        &self.spec.path
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.spec.check_frame(frame)?;
        if self.projected_size(1) > u32::MAX as u64 {
            return Err(Error::FileTooLarge);
        }
        let offset = (self.pos - self.movi_pos) as u32;
        let frame_bytes = self.frame_bytes;
        let stride_in = frame.stride();
        let stride_out = self.stride_out;
        let layout = self.layout;
        let is_color = self.spec.is_color;
        let w = self.wtr.as_mut().ok_or(Error::AlreadyDone)?;

        write_fourcc(w, CHUNK_ID)?;
        w.write_u32::<LittleEndian>(frame_bytes)?;
        match layout {
            RawLayout::Y800 => w.write_all(&frame.data[..stride_in * frame.height as usize])?,
            RawLayout::Dib => {
                // Bottom-up rows, BGR order.
                for row in frame.data.chunks_exact(stride_in).rev() {
                    let out = &mut self.row_buf[..];
                    if is_color {
                        for (dst, src) in out.chunks_exact_mut(3).zip(row.chunks_exact(3)) {
                            dst[0] = src[2];
                            dst[1] = src[1];
                            dst[2] = src[0];
                        }
                    } else {
                        out[..stride_in].copy_from_slice(row);
                    }
                    w.write_all(&self.row_buf[..stride_out])?;
                }
            }
        }
        if frame_bytes % 2 == 1 {
            w.write_all(&[0])?;
        }
        self.pos += 8 + frame_bytes as u64 + (frame_bytes as u64 % 2);
        self.index.push(IndexEntry {
            offset,
            size: frame_bytes,
        });
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let Some(mut w) = self.wtr.take() else {
            return Ok(());
        };
        let movi_size = (self.pos - self.movi_pos) as u32;

        write_fourcc(&mut w, b"idx1")?;
        w.write_u32::<LittleEndian>((self.index.len() as u64 * IDX1_ENTRY_SIZE) as u32)?;
        for entry in self.index.iter() {
            write_fourcc(&mut w, CHUNK_ID)?;
            w.write_u32::<LittleEndian>(AVIIF_KEYFRAME)?;
            w.write_u32::<LittleEndian>(entry.offset)?;
            w.write_u32::<LittleEndian>(entry.size)?;
        }
        let file_size = self.pos + 8 + self.index.len() as u64 * IDX1_ENTRY_SIZE;
        let n_frames = self.index.len() as u32;

        w.seek(SeekFrom::Start(4))?;
        w.write_u32::<LittleEndian>((file_size - 8) as u32)?;
        w.seek(SeekFrom::Start(self.total_frames_pos))?;
        w.write_u32::<LittleEndian>(n_frames)?;
        w.seek(SeekFrom::Start(self.stream_length_pos))?;
        w.write_u32::<LittleEndian>(n_frames)?;
        w.seek(SeekFrom::Start(self.movi_pos - 4))?;
        w.write_u32::<LittleEndian>(movi_size)?;
        w.flush()?;
        let file = w.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        tracing::debug!(
            "finished {} with {n_frames} frames",
            self.spec.path.display()
        );
        Ok(())
    }
}

impl Drop for AviWriter {
    fn drop(&mut self) {
        if self.wtr.is_some() {
            if let Err(e) = self.finish() {
                tracing::error!("while finishing {}: {e}", self.spec.path.display());
            }
        }
    }
}
