//! Binary wire codec for the client↔server protocol.
//!
//! Frames are self-contained: a 1-byte tag, then fixed-width big-endian
//! scalars, u16-length-prefixed UTF-8 strings and u32-length-prefixed byte
//! arrays. Tile keys travel as two i32 (tx, ty), never as text. Parsers
//! reject unknown tags, out-of-domain scalars, and trailing bytes.

use anyhow::{Result, bail, ensure};
use bytes::Bytes;

use crate::domain::{
    MAX_TILES_SUBSCRIBED, TILE_CELL_COUNT, TileKey, is_world_coord_valid,
};

/// Error codes carried by `err` frames.
pub mod codes {
    pub const BAD_MESSAGE: &str = "bad_message";
    pub const BAD_TILE: &str = "bad_tile";
    pub const SUB_LIMIT: &str = "sub_limit";
    pub const CHURN_LIMIT: &str = "churn_limit";
    pub const SETCELL_LIMIT: &str = "setcell_limit";
    pub const NOT_SUBSCRIBED: &str = "not_subscribed";
    pub const TILE_SUB_DENIED: &str = "tile_sub_denied";
    pub const TILE_READONLY_HOT: &str = "tile_readonly_hot";
    pub const SETCELL_REJECTED: &str = "setcell_rejected";
    pub const INTERNAL: &str = "internal";
}

/// Tile bit encoding name carried in `tileSnap`.
pub const ENC_RLE64: &str = "rle64";

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Sub = 1,
    Unsub = 2,
    SetCell = 3,
    Cur = 4,
    ResyncTile = 5,
    Hello = 6,
    TileSnap = 7,
    CellUp = 8,
    CellUpBatch = 9,
    CurUp = 10,
    Err = 11,
}

impl TryFrom<u8> for Tag {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Tag::Sub),
            2 => Ok(Tag::Unsub),
            3 => Ok(Tag::SetCell),
            4 => Ok(Tag::Cur),
            5 => Ok(Tag::ResyncTile),
            6 => Ok(Tag::Hello),
            7 => Ok(Tag::TileSnap),
            8 => Ok(Tag::CellUp),
            9 => Ok(Tag::CellUpBatch),
            10 => Ok(Tag::CurUp),
            11 => Ok(Tag::Err),
            _ => Err(()),
        }
    }
}

/// A version-tagged run of single-cell ops on one tile. The batch spans
/// versions `from_ver..=to_ver`, one version step per op, so
/// `to_ver - from_ver + 1 == ops.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellUpBatch {
    pub tile: TileKey,
    pub from_ver: u32,
    pub to_ver: u32,
    pub ops: Vec<(u16, u8)>,
}

/// Client → server frames.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Sub { tiles: Vec<TileKey> },
    Unsub { tiles: Vec<TileKey> },
    SetCell { tile: TileKey, i: u16, v: u8, op: String },
    Cur { x: f32, y: f32 },
    ResyncTile { tile: TileKey, have_ver: u32 },
}

/// Server → client frames.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Hello { uid: String, name: String, token: String },
    TileSnap { tile: TileKey, ver: u32, bits: String },
    CellUp { tile: TileKey, i: u16, v: u8, ver: u32 },
    CellUpBatch(CellUpBatch),
    CurUp { uid: String, name: String, x: f32, y: f32 },
    Err { code: String, msg: String },
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn tile(&mut self, t: TileKey) {
        self.i32(t.tx);
        self.i32(t.ty);
    }

    fn str(&mut self, s: &str) {
        debug_assert!(s.len() <= u16::MAX as usize, "string too long for wire");
        self.u16(s.len() as u16);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn bytes(&mut self, b: &[u8]) {
        self.u32(b.len() as u32);
        self.buf.extend_from_slice(b);
    }

    fn into_bytes(self) -> Bytes {
        self.buf.into()
    }
}

struct Reader<'a> {
    rest: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { rest: data }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        ensure!(self.rest.len() >= n, "frame truncated");
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn tile(&mut self) -> Result<TileKey> {
        let tx = self.i32()?;
        let ty = self.i32()?;
        Ok(TileKey::new(tx, ty))
    }

    fn str(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| anyhow::anyhow!("invalid UTF-8 in frame"))
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn finish(self) -> Result<()> {
        ensure!(self.rest.is_empty(), "trailing bytes in frame");
        Ok(())
    }
}

fn write_tile_list(w: &mut Writer, tiles: &[TileKey]) {
    debug_assert!(tiles.len() <= u16::MAX as usize);
    w.u16(tiles.len() as u16);
    for t in tiles {
        w.tile(*t);
    }
}

fn read_tile_list(r: &mut Reader<'_>) -> Result<Vec<TileKey>> {
    let count = r.u16()? as usize;
    ensure!(
        count <= MAX_TILES_SUBSCRIBED,
        "tile list exceeds subscription cap: {count}"
    );
    let mut tiles = Vec::with_capacity(count);
    for _ in 0..count {
        tiles.push(r.tile()?);
    }
    Ok(tiles)
}

fn ensure_cell(i: u16) -> Result<()> {
    ensure!((i as usize) < TILE_CELL_COUNT, "cell index out of range: {i}");
    Ok(())
}

fn ensure_bit(v: u8) -> Result<()> {
    ensure!(v <= 1, "cell value out of domain: {v}");
    Ok(())
}

impl ClientMessage {
    /// Decode a client frame. `Ok(None)` means the tag is unknown to this
    /// build and the frame should be ignored (forward compatibility);
    /// `Err` means the frame is malformed and worth an error reply.
    pub fn decode(data: &[u8]) -> Result<Option<Self>> {
        let mut r = Reader::new(data);
        let Ok(tag) = Tag::try_from(r.u8()?) else {
            return Ok(None);
        };
        let msg = match tag {
            Tag::Sub => ClientMessage::Sub {
                tiles: read_tile_list(&mut r)?,
            },
            Tag::Unsub => ClientMessage::Unsub {
                tiles: read_tile_list(&mut r)?,
            },
            Tag::SetCell => {
                let tile = r.tile()?;
                let i = r.u16()?;
                ensure_cell(i)?;
                let v = r.u8()?;
                ensure_bit(v)?;
                let op = r.str()?;
                ensure!(!op.is_empty(), "empty op id");
                ClientMessage::SetCell { tile, i, v, op }
            }
            Tag::Cur => {
                let x = r.f32()?;
                let y = r.f32()?;
                ensure!(is_world_coord_valid(x), "cursor x out of bounds");
                ensure!(is_world_coord_valid(y), "cursor y out of bounds");
                ClientMessage::Cur { x, y }
            }
            Tag::ResyncTile => {
                let tile = r.tile()?;
                let have_ver = r.u32()?;
                ClientMessage::ResyncTile { tile, have_ver }
            }
            _ => bail!("server-only tag in client frame"),
        };
        r.finish()?;
        Ok(Some(msg))
    }

    pub fn encode(&self) -> Bytes {
        match self {
            ClientMessage::Sub { tiles } => {
                let mut w = Writer::with_capacity(3 + tiles.len() * 8);
                w.u8(Tag::Sub as u8);
                write_tile_list(&mut w, tiles);
                w.into_bytes()
            }
            ClientMessage::Unsub { tiles } => {
                let mut w = Writer::with_capacity(3 + tiles.len() * 8);
                w.u8(Tag::Unsub as u8);
                write_tile_list(&mut w, tiles);
                w.into_bytes()
            }
            ClientMessage::SetCell { tile, i, v, op } => {
                let mut w = Writer::with_capacity(14 + op.len());
                w.u8(Tag::SetCell as u8);
                w.tile(*tile);
                w.u16(*i);
                w.u8(*v);
                w.str(op);
                w.into_bytes()
            }
            ClientMessage::Cur { x, y } => {
                let mut w = Writer::with_capacity(9);
                w.u8(Tag::Cur as u8);
                w.f32(*x);
                w.f32(*y);
                w.into_bytes()
            }
            ClientMessage::ResyncTile { tile, have_ver } => {
                let mut w = Writer::with_capacity(13);
                w.u8(Tag::ResyncTile as u8);
                w.tile(*tile);
                w.u32(*have_ver);
                w.into_bytes()
            }
        }
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Bytes {
        match self {
            ServerMessage::Hello { uid, name, token } => {
                let mut w = Writer::with_capacity(7 + uid.len() + name.len() + token.len());
                w.u8(Tag::Hello as u8);
                w.str(uid);
                w.str(name);
                w.str(token);
                w.into_bytes()
            }
            ServerMessage::TileSnap { tile, ver, bits } => {
                let mut w = Writer::with_capacity(24 + bits.len());
                w.u8(Tag::TileSnap as u8);
                w.tile(*tile);
                w.u32(*ver);
                w.str(ENC_RLE64);
                w.bytes(bits.as_bytes());
                w.into_bytes()
            }
            ServerMessage::CellUp { tile, i, v, ver } => {
                let mut w = Writer::with_capacity(16);
                w.u8(Tag::CellUp as u8);
                w.tile(*tile);
                w.u16(*i);
                w.u8(*v);
                w.u32(*ver);
                w.into_bytes()
            }
            ServerMessage::CellUpBatch(batch) => {
                let mut w = Writer::with_capacity(19 + batch.ops.len() * 3);
                w.u8(Tag::CellUpBatch as u8);
                w.tile(batch.tile);
                w.u32(batch.from_ver);
                w.u32(batch.to_ver);
                debug_assert!(batch.ops.len() <= u16::MAX as usize);
                w.u16(batch.ops.len() as u16);
                for (i, v) in &batch.ops {
                    w.u16(*i);
                    w.u8(*v);
                }
                w.into_bytes()
            }
            ServerMessage::CurUp { uid, name, x, y } => {
                let mut w = Writer::with_capacity(13 + uid.len() + name.len());
                w.u8(Tag::CurUp as u8);
                w.str(uid);
                w.str(name);
                w.f32(*x);
                w.f32(*y);
                w.into_bytes()
            }
            ServerMessage::Err { code, msg } => {
                let mut w = Writer::with_capacity(5 + code.len() + msg.len());
                w.u8(Tag::Err as u8);
                w.str(code);
                w.str(msg);
                w.into_bytes()
            }
        }
    }

    /// Decode a server frame, with the same unknown-tag contract as
    /// [`ClientMessage::decode`].
    pub fn decode(data: &[u8]) -> Result<Option<Self>> {
        let mut r = Reader::new(data);
        let Ok(tag) = Tag::try_from(r.u8()?) else {
            return Ok(None);
        };
        let msg = match tag {
            Tag::Hello => {
                let uid = r.str()?;
                let name = r.str()?;
                let token = r.str()?;
                ServerMessage::Hello { uid, name, token }
            }
            Tag::TileSnap => {
                let tile = r.tile()?;
                let ver = r.u32()?;
                let enc = r.str()?;
                ensure!(enc == ENC_RLE64, "unknown tile encoding: {enc:?}");
                let raw = r.bytes()?;
                let bits = std::str::from_utf8(raw)
                    .map_err(|_| anyhow::anyhow!("non-ASCII rle64 payload"))?
                    .to_owned();
                ServerMessage::TileSnap { tile, ver, bits }
            }
            Tag::CellUp => {
                let tile = r.tile()?;
                let i = r.u16()?;
                ensure_cell(i)?;
                let v = r.u8()?;
                ensure_bit(v)?;
                let ver = r.u32()?;
                ServerMessage::CellUp { tile, i, v, ver }
            }
            Tag::CellUpBatch => {
                let tile = r.tile()?;
                let from_ver = r.u32()?;
                let to_ver = r.u32()?;
                let count = r.u16()? as usize;
                ensure!(count > 0, "empty cell batch");
                ensure!(
                    to_ver >= from_ver && (to_ver - from_ver) as usize + 1 == count,
                    "batch version span does not match op count"
                );
                let mut ops = Vec::with_capacity(count);
                for _ in 0..count {
                    let i = r.u16()?;
                    ensure_cell(i)?;
                    let v = r.u8()?;
                    ensure_bit(v)?;
                    ops.push((i, v));
                }
                ServerMessage::CellUpBatch(CellUpBatch {
                    tile,
                    from_ver,
                    to_ver,
                    ops,
                })
            }
            Tag::CurUp => {
                let uid = r.str()?;
                let name = r.str()?;
                let x = r.f32()?;
                let y = r.f32()?;
                ensure!(is_world_coord_valid(x), "cursor x out of bounds");
                ensure!(is_world_coord_valid(y), "cursor y out of bounds");
                ServerMessage::CurUp { uid, name, x, y }
            }
            Tag::Err => {
                let code = r.str()?;
                let msg = r.str()?;
                ServerMessage::Err { code, msg }
            }
            _ => bail!("client-only tag in server frame"),
        };
        r.finish()?;
        Ok(Some(msg))
    }
}
