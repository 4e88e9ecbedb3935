use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::entry::{Callsite, Entry, EntryKind, EntryVariant, SkippedCall};
use crate::error::RrError;
use crate::prog_point::ProgPoint;

/// Serializes log entries, little-endian, in the order they are recorded.
pub struct LogWriter<W: Write> {
    inner: W,
    entries_written: u64,
}

impl<W: Write> LogWriter<W> {
    pub fn new(inner: W) -> LogWriter<W> {
        LogWriter {
            inner,
            entries_written: 0,
        }
    }

    pub fn entries_written(&self) -> u64 {
        self.entries_written
    }

    pub fn write_entry(&mut self, entry: &Entry) -> Result<(), RrError> {
        let w = &mut self.inner;
        write_prog_point(w, &entry.prog_point)?;
        w.write_u8(entry.variant.kind() as u8)?;
        w.write_u8(entry.callsite.0)?;
        match &entry.variant {
            EntryVariant::Input1(v) => w.write_u8(*v)?,
            EntryVariant::Input2(v) => w.write_u16::<LittleEndian>(*v)?,
            EntryVariant::Input4(v) => w.write_u32::<LittleEndian>(*v)?,
            EntryVariant::Input8(v) => w.write_u64::<LittleEndian>(*v)?,
            EntryVariant::InterruptRequest(v) => w.write_u16::<LittleEndian>(*v)?,
            EntryVariant::SkippedCall(call) => {
                w.write_u8(call.kind_byte())?;
                match call {
                    SkippedCall::MemRw {
                        addr,
                        buf,
                        len,
                        is_write,
                    } => {
                        w.write_u32::<LittleEndian>(*addr)?;
                        w.write_u32::<LittleEndian>(*len)?;
                        w.write_u8(u8::from(*is_write))?;
                        // only writes carry bytes; replaying a device
                        // read needs nothing
                        if *is_write {
                            w.write_all(buf)?;
                        }
                    }
                    SkippedCall::RegMemRegion {
                        start_addr,
                        size,
                        phys_offset,
                    } => {
                        w.write_u32::<LittleEndian>(*start_addr)?;
                        w.write_u64::<LittleEndian>(*size)?;
                        w.write_u64::<LittleEndian>(*phys_offset)?;
                    }
                }
            }
            EntryVariant::Last => {}
        }
        self.entries_written += 1;
        Ok(())
    }

    /// Writes the terminator entry and flushes.
    pub fn finish(mut self, at: ProgPoint) -> Result<(), RrError> {
        self.write_entry(&Entry {
            prog_point: at,
            callsite: Callsite::LAST,
            variant: EntryVariant::Last,
        })?;
        self.inner.flush()?;
        Ok(())
    }
}

/// Streams entries back out of a recorded log, one peek/consume pair at a
/// time; replay never needs more lookahead than the next entry.
pub struct LogReader<R: Read> {
    inner: R,
    peeked: Option<Entry>,
    /// Set once the terminator (or end of file) has been reached.
    at_end: bool,
    entries_read: u64,
}

impl<R: Read> LogReader<R> {
    pub fn new(inner: R) -> LogReader<R> {
        LogReader {
            inner,
            peeked: None,
            at_end: false,
            entries_read: 0,
        }
    }

    pub fn entries_read(&self) -> u64 {
        self.entries_read
    }

    pub fn at_end(&self) -> bool {
        self.at_end && self.peeked.is_none()
    }

    /// The next unconsumed entry, or `None` at end of log.
    pub fn peek(&mut self) -> Result<Option<&Entry>, RrError> {
        if self.peeked.is_none() && !self.at_end {
            match self.read_entry()? {
                Some(entry) => {
                    if entry.variant == EntryVariant::Last {
                        self.at_end = true;
                    } else {
                        self.peeked = Some(entry);
                    }
                }
                None => self.at_end = true,
            }
        }
        Ok(self.peeked.as_ref())
    }

    /// Consumes the entry [`peek`](Self::peek) exposed.
    pub fn take(&mut self) -> Option<Entry> {
        let entry = self.peeked.take();
        if entry.is_some() {
            self.entries_read += 1;
        }
        entry
    }

    fn read_entry(&mut self) -> Result<Option<Entry>, RrError> {
        let r = &mut self.inner;
        let prog_point = match read_prog_point(r) {
            Ok(p) => p,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let kind = r.read_u8()?;
        let callsite = Callsite(r.read_u8()?);
        let kind =
            EntryKind::from_u8(kind).ok_or(RrError::Malformed("unknown entry kind"))?;
        let variant = match kind {
            EntryKind::Input1 => EntryVariant::Input1(r.read_u8()?),
            EntryKind::Input2 => EntryVariant::Input2(r.read_u16::<LittleEndian>()?),
            EntryKind::Input4 => EntryVariant::Input4(r.read_u32::<LittleEndian>()?),
            EntryKind::Input8 => EntryVariant::Input8(r.read_u64::<LittleEndian>()?),
            EntryKind::InterruptRequest => {
                EntryVariant::InterruptRequest(r.read_u16::<LittleEndian>()?)
            }
            EntryKind::SkippedCall => {
                let call_kind = r.read_u8()?;
                match call_kind {
                    0 => {
                        let addr = r.read_u32::<LittleEndian>()?;
                        let len = r.read_u32::<LittleEndian>()?;
                        let is_write = r.read_u8()? != 0;
                        let mut buf = Vec::new();
                        if is_write {
                            buf.resize(len as usize, 0);
                            r.read_exact(&mut buf)?;
                        }
                        EntryVariant::SkippedCall(SkippedCall::MemRw {
                            addr,
                            buf,
                            len,
                            is_write,
                        })
                    }
                    1 => {
                        let start_addr = r.read_u32::<LittleEndian>()?;
                        let size = r.read_u64::<LittleEndian>()?;
                        let phys_offset = r.read_u64::<LittleEndian>()?;
                        EntryVariant::SkippedCall(SkippedCall::RegMemRegion {
                            start_addr,
                            size,
                            phys_offset,
                        })
                    }
                    _ => return Err(RrError::Malformed("unknown skipped-call kind")),
                }
            }
            EntryKind::Last => EntryVariant::Last,
        };
        Ok(Some(Entry {
            prog_point,
            callsite,
            variant,
        }))
    }
}

fn write_prog_point<W: Write>(w: &mut W, p: &ProgPoint) -> io::Result<()> {
    w.write_u32::<LittleEndian>(p.eip)?;
    w.write_u32::<LittleEndian>(p.ecx)?;
    w.write_u64::<LittleEndian>(p.instr_count)
}

fn read_prog_point<R: Read>(r: &mut R) -> io::Result<ProgPoint> {
    let eip = r.read_u32::<LittleEndian>()?;
    let ecx = r.read_u32::<LittleEndian>()?;
    let instr_count = r.read_u64::<LittleEndian>()?;
    Ok(ProgPoint {
        eip,
        ecx,
        instr_count,
    })
}
