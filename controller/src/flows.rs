// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Decomposition of orchestration flows into VLAN filter parameters.

use crate::Error;

/// IP protocol number whose presence marks an IGMP trap flow. Installing
/// a VLAN filter for these breaks multicast; they are ignored instead.
const IGMP_PROTOCOL: u8 = 2;

/// A flow as handed down by the orchestration system, reduced to the
/// fields the ONU adapter acts on.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlowDescription {
    pub cookie: u64,
    pub in_port: u32,
    /// Matched VLAN id; `None` matches any tag (transparent).
    pub match_vlan: Option<u16>,
    /// VLAN id to set on matched traffic; `None` leaves tags untouched.
    pub set_vlan: Option<u16>,
    /// Matched priority bits, if any.
    pub pcp: Option<u8>,
    /// Matched IP protocol, if any.
    pub ip_proto: Option<u8>,
    /// Write-metadata word; carries the technology-profile id in its
    /// upper half.
    pub metadata: u64,
}

impl FlowDescription {
    /// The technology-profile id encoded in the flow metadata.
    pub fn tech_profile_id(&self) -> u16 {
        ((self.metadata >> 32) & 0xffff) as u16
    }
}

/// What the VLAN filter machine is asked to enforce.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VlanFlowParams {
    pub tp_id: u16,
    pub match_vlan: Option<u16>,
    pub set_vlan: Option<u16>,
    pub pcp: Option<u8>,
}

/// The outcome of decomposing one flow.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FlowDecision {
    Install(VlanFlowParams),
    /// The flow is accepted but no filter is installed.
    Ignore(&'static str),
}

/// Validate a flow description and reduce it to filter parameters.
///
/// Rejections here happen before any protocol exchange; they are the
/// caller-input error class and are returned synchronously.
pub fn decompose(flow: &FlowDescription) -> Result<FlowDecision, Error> {
    if flow.metadata == 0 {
        return Err(Error::InvalidFlow("flow carries no metadata"));
    }
    let tp_id = flow.tech_profile_id();
    if tp_id == 0 {
        return Err(Error::InvalidFlow(
            "metadata carries no technology-profile id",
        ));
    }
    if flow.ip_proto == Some(IGMP_PROTOCOL) {
        return Ok(FlowDecision::Ignore("IGMP trap flow"));
    }
    let set_vlan = match (flow.set_vlan, flow.match_vlan) {
        // No rewrite and no specific match: transparent pass-through.
        (None, None) => None,
        (None, Some(_)) => {
            return Err(Error::InvalidFlow(
                "match on a specific VLAN without a VLAN to set",
            ));
        }
        (Some(vid), _) => Some(vid & 0x0fff),
    };
    Ok(FlowDecision::Install(VlanFlowParams {
        tp_id,
        match_vlan: flow.match_vlan,
        set_vlan,
        pcp: flow.pcp,
    }))
}
