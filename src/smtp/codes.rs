//-
// Copyright (c) 2024, the Tidemail developers
//
// This file is part of Tidemail.
//
// Tidemail is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Tidemail is distributed  in the hope that it  will be useful,  but WITHOUT
// ANY WARRANTY; without even  the implied warranty of  MERCHANTABILITY or
// FITNESS FOR  A PARTICULAR  PURPOSE. See the  GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Tidemail. If not, see <http://www.gnu.org/licenses/>.

//! Response codes from RFC 5321 (plus the RFC 4954 AUTH codes).
//!
//! The module is designed to be wildcard-imported; `pc` gives short access
//! to the enum values.
#![allow(dead_code)]

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum PrimaryCode {
    HelpMessage = 214,
    ServiceReady = 220,
    ServiceClosing = 221,
    AuthenticationSucceeded = 235,
    Ok = 250,
    WillForward = 251,
    CannotVerify = 252,
    ServerChallenge = 334,
    StartMailInput = 354,
    ServiceNotAvailableClosing = 421,
    ActionNotTakenTemporary = 450,
    ActionAborted = 451,
    InsufficientStorage = 452,
    CommandSyntaxError = 500,
    ParameterSyntaxError = 501,
    CommandNotImplemented = 502,
    BadSequenceOfCommands = 503,
    CommandParameterNotImplemented = 504,
    AuthenticationRequired = 530,
    AuthenticationCredentialsInvalid = 535,
    ActionNotTakenPermanent = 550,
    ExceededStorageAllocation = 552,
    TransactionFailed = 554,
}

pub mod pc {
    pub use super::PrimaryCode::*;
}
