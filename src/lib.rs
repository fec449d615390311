//! A cycle-accounted simulator for a Z8-style 8-bit microcontroller.
//!
//! Besides the instruction set of the microcontroller, this simulates
//! a configurable cache in front of program memory,
//! devices bound to register slots, group-priority interrupts,
//! and the predicated-execution `IF` instruction.
//!
//! # Usage
//!
//! Program images are read from S-records:
//! ```
//! use z8_sim::image::srec;
//!
//! let src = "
//! S0 increment
//! S109000CE6101520106F40
//! S9000C
//! ";
//! let image = srec::parse(src).unwrap();
//! ```
//!
//! Once an image has been loaded, it can be executed with the simulator:
//! ```
//! # use z8_sim::image::srec;
//! # let image = srec::parse("S109000CE6101520106F40\nS9000C").unwrap();
//! use z8_sim::sim::{Simulator, RunOutcome};
//!
//! let mut simulator = Simulator::new(Default::default());
//! simulator.load_image(&image);
//! assert_eq!(simulator.run(), RunOutcome::Halted);
//! ```
//!
//! If more granularity is needed for simulation, there are also step-in functions and breakpoints.
//! See the [`sim`] module for more details.
#![warn(missing_docs)]

pub mod isa;
pub mod image;
pub mod sim;
