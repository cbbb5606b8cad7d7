// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{validate_tuple, ClientError, Pattern};
use std::str::FromStr;

/// One line of the client command language. Arguments are whitespace
/// separated, so tuples and patterns cannot contain spaces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Put(String),
    Read(String),
    Take(String),
    GetState(String),
    Sleep(u64),
    SetDelay { qualifier: String, secs: u64 },
}

fn seconds(word: &str) -> Result<u64, ClientError> {
    word.parse::<u64>()
        .map_err(|_| ClientError::InvalidCommand(format!("not a number of seconds: {}", word)))
}

impl FromStr for Command {
    type Err = ClientError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let cmd = match words.as_slice() {
            ["put", t] => {
                validate_tuple(t).map_err(ClientError::Invalid)?;
                Command::Put(t.to_string())
            }
            ["read", p] => {
                Pattern::parse(p).map_err(ClientError::Invalid)?;
                Command::Read(p.to_string())
            }
            ["take", p] => {
                Pattern::parse(p).map_err(ClientError::Invalid)?;
                Command::Take(p.to_string())
            }
            ["getTupleSpacesState", q] => Command::GetState(q.to_string()),
            ["sleep", s] => Command::Sleep(seconds(s)?),
            ["setdelay", q, s] => Command::SetDelay {
                qualifier: q.to_string(),
                secs: seconds(s)?,
            },
            _ => return Err(ClientError::InvalidCommand(line.trim().to_string())),
        };
        Ok(cmd)
    }
}
