//! Program images.
//!
//! An [`Image`] is what gets loaded into the [`Simulator`]: runs of bytes destined for
//! PROGRAM memory, DATA memory, or register memory, an optional name, and the initial PC.
//!
//! Images are typically read from S-record files (see [`srec`]),
//! but they can also be built directly:
//!
//! ```
//! use z8_sim::image::{Image, Region};
//! use z8_sim::sim::Simulator;
//!
//! let mut image = Image::new();
//! image.push(Region::Program, 0x0100, vec![0x6F]); // STOP
//! image.entry = Some(0x0100);
//!
//! let mut sim = Simulator::new(Default::default());
//! sim.load_image(&image);
//! sim.run();
//! assert_eq!(sim.pc, 0x0101);
//! ```
//!
//! [`Simulator`]: crate::sim::Simulator
pub mod srec;

/// The memory a [`Block`] is loaded into.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Region {
    /// PROGRAM memory (`S1` records).
    Program,
    /// DATA memory (`S2` records).
    Data,
    /// Register memory (`S3` records).
    ///
    /// Register blocks are copied as raw content, bypassing slot policies.
    Register,
}

/// A contiguous run of bytes.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Block {
    /// The memory this block is loaded into.
    pub region: Region,
    /// The address (or slot) of the first byte.
    pub start: u16,
    /// The bytes.
    pub data: Vec<u8>,
}

/// A loadable program image.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct Image {
    /// The name of the image (from the `S0` record), if any.
    pub name: Option<String>,
    /// The initial PC (from the `S9` record), if any.
    ///
    /// If absent, loading the image leaves the PC unchanged.
    pub entry: Option<u16>,
    /// The blocks of the image, in load order.
    pub blocks: Vec<Block>,
}

impl Image {
    /// Creates an empty image.
    pub fn new() -> Self {
        Default::default()
    }

    /// Appends a block to the image.
    ///
    /// If the block continues the last block (same region, starting right where it ends),
    /// the bytes are appended to that block instead.
    pub fn push(&mut self, region: Region, start: u16, data: Vec<u8>) {
        match self.blocks.last_mut() {
            Some(last) if last.region == region && usize::from(last.start) + last.data.len() == usize::from(start) => {
                last.data.extend(data);
            },
            _ => self.blocks.push(Block { region, start, data }),
        }
    }

    /// Iterates over the blocks loaded into a given region.
    pub fn blocks_in(&self, region: Region) -> impl Iterator<Item = &Block> + '_ {
        self.blocks.iter().filter(move |b| b.region == region)
    }

    /// Total number of bytes across all blocks.
    pub fn len(&self) -> usize {
        self.blocks.iter().map(|b| b.data.len()).sum()
    }

    /// Whether the image holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
