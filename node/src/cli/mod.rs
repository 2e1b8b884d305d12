//! Utilities for the Command Line Interface (CLI)
//! that represents a DHT node.

use std::{env, error::Error};

use crate::chord::Address;

/// Contains the different arguments
/// required to run a DHT node.
#[derive(Debug, PartialEq, Eq)]
pub enum Args {
    /// Used to initiate a new ring.
    Init { addr: Address },
    /// Used to join an existing ring.
    Join { addr: Address, remote: Address },
}

impl Args {
    /// Parses all received arguments, performs type
    /// verification and builds an `Args` instance.
    pub fn parse() -> Result<Self, Box<dyn Error>> {
        let mut args = env::args().skip(1);
        let action = args.next().ok_or("invalid argument(s)")?;

        if action != "init" && action != "join" {
            return Err(From::from("invalid argument(s)"));
        }

        let addr_arg = args.next().ok_or("addr argument is missing")?;
        let addr_value = addr_arg.split("addr=").last().unwrap(); // Safe unwrap
        let addr = addr_value
            .parse::<Address>()
            .map_err(|_| "addr argument is missing or invalid")?;

        if action == "init" {
            return Ok(Self::Init { addr });
        }

        let remote_arg = args.next().ok_or("remote argument is missing")?;
        let remote_value = remote_arg.split("remote=").last().unwrap(); // Safe unwrap
        let remote = remote_value
            .parse::<Address>()
            .map_err(|_| "remote argument is missing or invalid")?;

        Ok(Self::Join { addr, remote })
    }

    /// Gets the address this node binds to.
    pub fn addr(&self) -> &Address {
        match *self {
            Self::Init { ref addr } => addr,
            Self::Join { ref addr, .. } => addr,
        }
    }

    /// Gets the bootstrap address.
    /// Only available with join.
    pub fn remote(&self) -> Option<&Address> {
        match *self {
            Self::Init { .. } => None,
            Self::Join { ref remote, .. } => Some(remote),
        }
    }
}
