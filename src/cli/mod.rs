pub mod args;

pub use args::{Arguments, Module};

use clap::Parser;

pub fn parse() -> Arguments {
    Arguments::parse()
}
