//! Reading and writing images as S-records.
//!
//! Each line of an S-record file is one record:
//! - `S0<name>`: names the image.
//! - `S1`, `S2`, `S3`: a run of bytes for PROGRAM memory, DATA memory, and register memory respectively.
//!   These are written as hex pairs: the record length (address bytes + data bytes + checksum byte),
//!   the big-endian start address, the data bytes, and finally the checksum byte.
//!   All of these bytes must sum to `FF` (mod 256).
//! - `S9<addr>`: the initial PC (four hex digits, no length or checksum).
//!
//! Record types `S4` through `S8` are accepted and ignored. Blank lines are skipped.
//!
//! ```
//! use z8_sim::image::{srec, Region};
//!
//! let image = srec::parse("S0 demo\nS105000C6F7F00\nS9000C").unwrap();
//! assert_eq!(image.name.as_deref(), Some("demo"));
//! assert_eq!(image.entry, Some(0x000C));
//! assert_eq!(image.blocks[0].region, Region::Program);
//! assert_eq!(image.blocks[0].data, [0x6F, 0x7F]);
//!
//! assert!(srec::parse("S105000C6F7F01").is_err()); // bad checksum
//! ```
use logos::Logos;

use super::{Image, Region};

/// A hex pair within a record.
#[derive(Debug, Logos, PartialEq, Eq)]
#[logos(error = LoadErrKind)]
enum Token {
    #[regex(r"[0-9A-Fa-f][0-9A-Fa-f]", |lx| u8::from_str_radix(lx.slice(), 16).ok())]
    Byte(u8),
}

/// The bytes written with each data record by [`to_string`].
const RECORD_DATA_LEN: usize = 16;

/// Kinds of errors that can occur while reading S-records.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum LoadErrKind {
    /// The line does not start with `S`.
    MissingS,
    /// The record type is not a digit.
    BadType,
    /// The bytes of the record do not sum to `FF`.
    BadChecksum,
    /// The record has invalid hex digits or is the wrong length.
    #[default]
    Malformed,
    /// A register-memory record runs past slot `FF`.
    RegisterOverflow,
}
impl std::fmt::Display for LoadErrKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadErrKind::MissingS         => f.write_str("invalid srec - missing 'S'"),
            LoadErrKind::BadType          => f.write_str("invalid srec - bad record type"),
            LoadErrKind::BadChecksum      => f.write_str("invalid srec - checksum error"),
            LoadErrKind::Malformed        => f.write_str("invalid srec - malformed record"),
            LoadErrKind::RegisterOverflow => f.write_str("invalid srec - register record runs past slot FF"),
        }
    }
}

/// An error that occurred while reading S-records.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct LoadErr {
    /// The line of the offending record (starting at 1).
    pub line: usize,
    /// The kind of error.
    pub kind: LoadErrKind,
}
impl std::fmt::Display for LoadErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.kind)
    }
}
impl std::error::Error for LoadErr {}

fn hex_bytes(digits: &str) -> Result<Vec<u8>, LoadErrKind> {
    Token::lexer(digits)
        .map(|t| t.map(|Token::Byte(b)| b))
        .collect()
}

/// Reads an image from S-records.
///
/// Reading stops at the first invalid record.
pub fn parse(src: &str) -> Result<Image, LoadErr> {
    let mut image = Image::new();

    for (i, line) in src.lines().enumerate() {
        let line_no = i + 1;
        let line = line.trim();
        if line.is_empty() { continue; }

        parse_record(line, &mut image)
            .map_err(|kind| LoadErr { line: line_no, kind })?;
    }

    Ok(image)
}

fn parse_record(line: &str, image: &mut Image) -> Result<(), LoadErrKind> {
    let rest = line.strip_prefix('S').ok_or(LoadErrKind::MissingS)?;
    let rtype = rest.chars().next()
        .and_then(|c| c.to_digit(10))
        .ok_or(LoadErrKind::BadType)?;
    // the type digit is ASCII, so this is a char boundary
    let body = &rest[1..];

    match rtype {
        0 => image.name = Some(body.trim().to_string()),
        9 => {
            let digits = body.get(..4).ok_or(LoadErrKind::Malformed)?;
            let &[hi, lo] = hex_bytes(digits)?.as_slice() else {
                return Err(LoadErrKind::Malformed);
            };
            image.entry = Some(u16::from_be_bytes([hi, lo]));
        },
        1 => parse_data(Region::Program, body, image)?,
        2 => parse_data(Region::Data, body, image)?,
        3 => parse_data(Region::Register, body, image)?,
        _ => log::debug!("ignoring S{rtype} record"),
    }

    Ok(())
}

fn parse_data(region: Region, body: &str, image: &mut Image) -> Result<(), LoadErrKind> {
    let bytes = hex_bytes(body)?;
    let &[len, ah, al, ref rest @ ..] = bytes.as_slice() else {
        return Err(LoadErrKind::Malformed);
    };
    // length counts the two address bytes, the data, and the checksum
    if rest.is_empty() || usize::from(len) != rest.len() + 2 {
        return Err(LoadErrKind::Malformed);
    }
    if bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) != 0xFF {
        return Err(LoadErrKind::BadChecksum);
    }

    let start = u16::from_be_bytes([ah, al]);
    let data = rest[..rest.len() - 1].to_vec();
    if region == Region::Register && usize::from(start) + data.len() > 0x100 {
        return Err(LoadErrKind::RegisterOverflow);
    }

    image.push(region, start, data);
    Ok(())
}

/// Writes an image as S-records.
///
/// Blocks are split into records of at most 16 data bytes.
///
/// ```
/// use z8_sim::image::{srec, Image, Region};
///
/// let mut image = Image::new();
/// image.push(Region::Program, 0x000C, vec![0x6F, 0x7F]);
/// image.entry = Some(0x000C);
///
/// assert_eq!(srec::to_string(&image), "S105000C6F7F00\nS9000C\n");
/// ```
pub fn to_string(image: &Image) -> String {
    Records(image).to_string()
}

struct Records<'a>(&'a Image);
impl std::fmt::Display for Records<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Records(image) = self;

        if let Some(name) = &image.name {
            writeln!(f, "S0 {name}")?;
        }
        for block in &image.blocks {
            let rtype = match block.region {
                Region::Program  => 1,
                Region::Data     => 2,
                Region::Register => 3,
            };

            let mut addr = block.start;
            for chunk in block.data.chunks(RECORD_DATA_LEN) {
                let len = chunk.len() as u8 + 3;
                let [ah, al] = addr.to_be_bytes();
                let sum = chunk.iter().fold(len.wrapping_add(ah).wrapping_add(al), |acc, &b| acc.wrapping_add(b));

                write!(f, "S{rtype}{len:02X}{addr:04X}")?;
                for b in chunk {
                    write!(f, "{b:02X}")?;
                }
                writeln!(f, "{:02X}", !sum)?;

                addr = addr.wrapping_add(chunk.len() as u16);
            }
        }
        if let Some(entry) = image.entry {
            writeln!(f, "S9{entry:04X}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::image::Block;

    use super::*;

    fn err(line: usize, kind: LoadErrKind) -> Result<Image, LoadErr> {
        Err(LoadErr { line, kind })
    }

    #[test]
    fn test_regions() {
        let src = "\
S0 Test of all ADC modes with IF
S10C000C1F79FFFF3101DF1F7FA2
S30B00100F011381801610108A
S9000c
";
        let image = parse(src).unwrap();
        assert_eq!(image.name.as_deref(), Some("Test of all ADC modes with IF"));
        assert_eq!(image.entry, Some(0x000C));
        assert_eq!(image.blocks, [
            Block { region: Region::Program, start: 0x000C, data: vec![0x1F, 0x79, 0xFF, 0xFF, 0x31, 0x01, 0xDF, 0x1F, 0x7F] },
            Block { region: Region::Register, start: 0x0010, data: vec![0x0F, 0x01, 0x13, 0x81, 0x80, 0x16, 0x10, 0x10] },
        ]);
        assert_eq!(image.len(), 17);
    }

    #[test]
    fn test_errors() {
        assert_eq!(parse("S9000C\nX105000C6F7F00"), err(2, LoadErrKind::MissingS));
        assert_eq!(parse("SX05000C6F7F00"), err(1, LoadErrKind::BadType));
        assert_eq!(parse("S"), err(1, LoadErrKind::BadType));
        assert_eq!(parse("\n\nS105000C6F7F01"), err(3, LoadErrKind::BadChecksum));
        assert_eq!(parse("S106000C6F7F00"), err(1, LoadErrKind::Malformed));
        assert_eq!(parse("S105000C6G7F00"), err(1, LoadErrKind::Malformed));
        assert_eq!(parse("S9C"), err(1, LoadErrKind::Malformed));
        // 2 bytes starting at slot FF
        assert_eq!(parse("S30500FF1122C8"), err(1, LoadErrKind::RegisterOverflow));
    }

    #[test]
    fn test_ignored_records() {
        let image = parse("S5030001FB\n\n   \nS9ABCD").unwrap();
        assert!(image.blocks.is_empty());
        assert_eq!(image.entry, Some(0xABCD));
    }

    #[test]
    fn test_contiguous_records_merge() {
        let image = parse("S105000C6F7F00\nS104000E01EC\nS104001002E9").unwrap();
        assert_eq!(image.blocks, [
            Block { region: Region::Program, start: 0x000C, data: vec![0x6F, 0x7F, 0x01] },
            Block { region: Region::Program, start: 0x0010, data: vec![0x02] },
        ]);
    }

    #[test]
    fn test_write_splits_records() {
        let mut image = Image::new();
        image.name = Some("split".to_string());
        image.push(Region::Data, 0x2000, (0..20).collect());
        image.push(Region::Register, 0x0010, vec![0xAA]);

        let text = to_string(&image);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("S2132000"));
        assert!(lines[2].starts_with("S2072010"));
        assert!(lines[3].starts_with("S3040010AA"));

        let read = parse(&text).unwrap();
        assert_eq!(read.blocks.len(), 2);
        assert_eq!(read, image);
    }
}
