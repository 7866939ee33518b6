//! Capability negotiation.
//!
//! A capability code is a 32-bit value: the high 12 bits name a page, the
//! low bits are flags local to that page. The initiator proposes one code
//! per page it supports, the responder intersects with its own set and
//! returns the agreed codes. Negotiation happens once, during
//! `CreateConnection`, and the resulting dialect never changes afterwards.

use crate::error::{Result, TransportError};

/// High 12 bits select the page.
pub const PAGE_MASK: u32 = 0xFFF0_0000;

/// Message format 2 basic page. Mandatory.
pub const MESSAGE2_BASIC_PAGE: u32 = 0x0200_0000;
pub const MESSAGE2_BASIC_ENABLE: u32 = 0x0000_0001;
pub const MESSAGE2_BASIC_CONNECTCOMBINED: u32 = 0x0000_0002;

/// Message format 4 basic page (header section omission).
pub const MESSAGE4_BASIC_PAGE: u32 = 0x0400_0000;
pub const MESSAGE4_BASIC_ENABLE: u32 = 0x0000_0001;
pub const MESSAGE4_BASIC_CONNECTCOMBINED: u32 = 0x0000_0002;

/// Message format 4 string table page. Recognised, never enabled here.
pub const MESSAGE4_STRINGTABLE_PAGE: u32 = 0x0410_0000;
pub const MESSAGE4_STRINGTABLE_ENABLE: u32 = 0x0000_0001;
pub const MESSAGE4_STRINGTABLE_MESSAGE_LOCAL: u32 = 0x0000_0002;
pub const MESSAGE4_STRINGTABLE_STANDARD_TABLE: u32 = 0x0000_0004;

/// Named capabilities answered by `StreamCheckCapability`.
pub const CAPABILITY_NAME_MESSAGE2_BASIC: &str = "com.robotraconteur.message2.basic";
pub const CAPABILITY_NAME_MESSAGE4_BASIC: &str = "com.robotraconteur.message4.basic";
pub const CAPABILITY_NAME_MESSAGE4_STRINGTABLE: &str = "com.robotraconteur.message4.stringtable";

/// Page part of a code.
#[inline]
pub fn page_of(code: u32) -> u32 {
    code & PAGE_MASK
}

/// Flag part of a code.
#[inline]
pub fn flags_of(code: u32) -> u32 {
    code & !PAGE_MASK
}

/// Flags defined for a page, `None` for unknown pages.
pub fn defined_flags(page: u32) -> Option<u32> {
    match page {
        MESSAGE2_BASIC_PAGE => Some(MESSAGE2_BASIC_ENABLE | MESSAGE2_BASIC_CONNECTCOMBINED),
        MESSAGE4_BASIC_PAGE => Some(MESSAGE4_BASIC_ENABLE | MESSAGE4_BASIC_CONNECTCOMBINED),
        MESSAGE4_STRINGTABLE_PAGE => Some(
            MESSAGE4_STRINGTABLE_ENABLE
                | MESSAGE4_STRINGTABLE_MESSAGE_LOCAL
                | MESSAGE4_STRINGTABLE_STANDARD_TABLE,
        ),
        _ => None,
    }
}

/// Capabilities a node supports, one flag word per page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilitySet {
    pub message2_basic: u32,
    pub message4_basic: u32,
    pub message4_string_table: u32,
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self::new(true, true)
    }
}

impl CapabilitySet {
    /// Build a set. Format 2 basic is always enabled.
    pub fn new(enable_message4: bool, enable_connect_combined: bool) -> Self {
        let combined2 = if enable_connect_combined {
            MESSAGE2_BASIC_CONNECTCOMBINED
        } else {
            0
        };
        let message4 = if enable_message4 {
            MESSAGE4_BASIC_ENABLE
                | if enable_connect_combined {
                    MESSAGE4_BASIC_CONNECTCOMBINED
                } else {
                    0
                }
        } else {
            0
        };
        Self {
            message2_basic: MESSAGE2_BASIC_ENABLE | combined2,
            message4_basic: message4,
            message4_string_table: 0,
        }
    }

    /// Set with only format 2 basic enabled.
    pub fn message2_only() -> Self {
        Self::new(false, false)
    }

    fn flags_for(&self, page: u32) -> u32 {
        match page {
            MESSAGE2_BASIC_PAGE => self.message2_basic,
            MESSAGE4_BASIC_PAGE => self.message4_basic,
            MESSAGE4_STRINGTABLE_PAGE => self.message4_string_table,
            _ => 0,
        }
    }

    /// Codes the initiator proposes: one per page with any flag set.
    pub fn propose(&self) -> Vec<u32> {
        [
            MESSAGE2_BASIC_PAGE,
            MESSAGE4_BASIC_PAGE,
            MESSAGE4_STRINGTABLE_PAGE,
        ]
        .into_iter()
        .filter_map(|page| {
            let flags = self.flags_for(page);
            (flags != 0).then_some(page | flags)
        })
        .collect()
    }

    /// Named-capability lookup for `StreamCheckCapability`.
    pub fn check_named(&self, name: &str) -> u32 {
        match name {
            CAPABILITY_NAME_MESSAGE2_BASIC => self.message2_basic,
            CAPABILITY_NAME_MESSAGE4_BASIC => self.message4_basic,
            CAPABILITY_NAME_MESSAGE4_STRINGTABLE => self.message4_string_table,
            _ => 0,
        }
    }
}

/// Protocol dialect agreed for the lifetime of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NegotiatedDialect {
    /// Write path uses version 4 framing.
    pub message4: bool,
    /// Peer accepts the combined connect/capability handshake.
    pub connect_combined: bool,
    /// Always false: the string table page is recognised but not implemented.
    pub string_table: bool,
}

impl NegotiatedDialect {
    fn from_codes(codes: &[u32]) -> Self {
        let mut dialect = NegotiatedDialect::default();
        for &code in codes {
            let flags = flags_of(code);
            match page_of(code) {
                MESSAGE2_BASIC_PAGE => {
                    dialect.connect_combined |= flags & MESSAGE2_BASIC_CONNECTCOMBINED != 0;
                }
                MESSAGE4_BASIC_PAGE => {
                    dialect.message4 |= flags & MESSAGE4_BASIC_ENABLE != 0;
                }
                _ => {}
            }
        }
        dialect
    }
}

fn require_message2(codes: &[u32], who: &str) -> Result<()> {
    let ok = codes.iter().any(|&c| {
        page_of(c) == MESSAGE2_BASIC_PAGE && flags_of(c) & MESSAGE2_BASIC_ENABLE != 0
    });
    if ok {
        Ok(())
    } else {
        Err(TransportError::protocol(format!(
            "{} does not enable message format 2 basic",
            who
        )))
    }
}

/// Responder side: intersect the proposal with the local set.
///
/// Unknown pages in the proposal are ignored (forward compatibility).
pub fn negotiate_responder(
    proposed: &[u32],
    supported: &CapabilitySet,
) -> Result<(Vec<u32>, NegotiatedDialect)> {
    require_message2(proposed, "Capability proposal")?;
    if supported.message2_basic & MESSAGE2_BASIC_ENABLE == 0 {
        return Err(TransportError::protocol(
            "Local node does not support message format 2 basic",
        ));
    }

    let mut agreed = Vec::new();
    for &code in proposed {
        let page = page_of(code);
        let defined = match defined_flags(page) {
            Some(d) => d,
            None => continue,
        };
        let flags = flags_of(code) & defined & supported.flags_for(page);
        // Without the enable bit the rest of the page is meaningless.
        if flags & 0x1 == 0 {
            continue;
        }
        if agreed.iter().any(|&c| page_of(c) == page) {
            return Err(TransportError::protocol(format!(
                "Capability page {:#010x} proposed twice",
                page
            )));
        }
        agreed.push(page | flags);
    }
    // The string table is never agreed to by this implementation.
    agreed.retain(|&c| page_of(c) != MESSAGE4_STRINGTABLE_PAGE);
    let dialect = NegotiatedDialect::from_codes(&agreed);
    Ok((agreed, dialect))
}

/// Initiator side: validate the responder's answer against what was proposed.
pub fn apply_response(proposed: &[u32], response: &[u32]) -> Result<NegotiatedDialect> {
    require_message2(response, "Capability response")?;
    for &code in response {
        let page = page_of(code);
        let defined = defined_flags(page).ok_or_else(|| {
            TransportError::protocol(format!("Unknown capability page {:#010x}", page))
        })?;
        let flags = flags_of(code);
        if flags & !defined != 0 {
            return Err(TransportError::protocol(format!(
                "Invalid capability flags {:#x} for page {:#010x}",
                flags, page
            )));
        }
        let offered = proposed
            .iter()
            .find(|&&p| page_of(p) == page)
            .map(|&p| flags_of(p))
            .unwrap_or(0);
        if flags & !offered != 0 {
            return Err(TransportError::protocol(format!(
                "Capability response enables flags {:#x} that were not proposed on page {:#010x}",
                flags & !offered,
                page
            )));
        }
    }
    Ok(NegotiatedDialect::from_codes(response))
}
