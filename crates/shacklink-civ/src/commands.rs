//! The logical CI-V command catalog.
//!
//! Each logical operation the controller performs maps to a fixed
//! opcode/sub-opcode prefix (IC-705 CI-V reference, Icom document
//! A7508-1EX). [`SlotId`] identifies the controller's one-per-operation
//! command slots; [`SlotId::prefix`] is the wire prefix the request is
//! built from.

use crate::civ::encode_packet;

/// Identity of a logical command slot.
///
/// Every operation owns exactly one slot; reissuing an operation
/// overwrites its slot (latest wins) rather than queueing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotId {
    GetFreq,
    GetMode,
    GetPwr,
    GetS,
    GetOvf,
    GetSwr,
    GetTransmitStatus,
    GetTuneStatus,
    GetPreamp,
    GetAgc,
    GetVd,
    GetTuningStep,
    GetRfGain,
    GetSql,
    GetNr,
    GetNrEnabled,
    GetSplit,
    GetMainVfoFreq,
    GetSubVfoFreq,
    GetMainVfoMode,
    GetSubVfoMode,
    SetPwr,
    SetRfGain,
    SetSql,
    SetNr,
    SetMainVfoFreq,
    SetSubVfoFreq,
    SetMode,
    SetSubVfoMode,
    SetPtt,
    SetTune,
    SetDataMode,
    SetPreamp,
    SetAgc,
    SetNrEnabled,
    SetTuningStep,
    SetVfo,
    SetSplit,
}

impl SlotId {
    /// The opcode/sub-opcode prefix this operation's requests start
    /// with.
    pub fn prefix(&self) -> &'static [u8] {
        match self {
            SlotId::GetFreq => &[0x03],
            SlotId::GetMode => &[0x04],
            SlotId::SetMode => &[0x06],
            SlotId::SetVfo => &[0x07],
            SlotId::GetSplit | SlotId::SetSplit => &[0x0F],
            SlotId::GetTuningStep | SlotId::SetTuningStep => &[0x10],
            SlotId::GetRfGain | SlotId::SetRfGain => &[0x14, 0x02],
            SlotId::GetSql | SlotId::SetSql => &[0x14, 0x03],
            SlotId::GetNr | SlotId::SetNr => &[0x14, 0x06],
            SlotId::GetPwr | SlotId::SetPwr => &[0x14, 0x0A],
            SlotId::GetS => &[0x15, 0x02],
            SlotId::GetSwr => &[0x15, 0x12],
            SlotId::GetVd => &[0x15, 0x15],
            SlotId::GetPreamp | SlotId::SetPreamp => &[0x16, 0x02],
            SlotId::GetAgc | SlotId::SetAgc => &[0x16, 0x12],
            SlotId::GetNrEnabled | SlotId::SetNrEnabled => &[0x16, 0x40],
            SlotId::SetDataMode => &[0x1A, 0x06],
            SlotId::GetOvf => &[0x1A, 0x09],
            SlotId::GetTransmitStatus | SlotId::SetPtt => &[0x1C, 0x00],
            SlotId::GetTuneStatus | SlotId::SetTune => &[0x1C, 0x01],
            SlotId::GetMainVfoFreq | SlotId::SetMainVfoFreq => &[0x25, 0x00],
            SlotId::GetSubVfoFreq | SlotId::SetSubVfoFreq => &[0x25, 0x01],
            SlotId::GetMainVfoMode => &[0x26, 0x00],
            SlotId::GetSubVfoMode | SlotId::SetSubVfoMode => &[0x26, 0x01],
        }
    }

    /// Name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            SlotId::GetFreq => "get_freq",
            SlotId::GetMode => "get_mode",
            SlotId::GetPwr => "get_pwr",
            SlotId::GetS => "get_s",
            SlotId::GetOvf => "get_ovf",
            SlotId::GetSwr => "get_swr",
            SlotId::GetTransmitStatus => "get_transmit_status",
            SlotId::GetTuneStatus => "get_tune_status",
            SlotId::GetPreamp => "get_preamp",
            SlotId::GetAgc => "get_agc",
            SlotId::GetVd => "get_vd",
            SlotId::GetTuningStep => "get_tuning_step",
            SlotId::GetRfGain => "get_rf_gain",
            SlotId::GetSql => "get_sql",
            SlotId::GetNr => "get_nr",
            SlotId::GetNrEnabled => "get_nr_enabled",
            SlotId::GetSplit => "get_split",
            SlotId::GetMainVfoFreq => "get_main_vfo_freq",
            SlotId::GetSubVfoFreq => "get_sub_vfo_freq",
            SlotId::GetMainVfoMode => "get_main_vfo_mode",
            SlotId::GetSubVfoMode => "get_sub_vfo_mode",
            SlotId::SetPwr => "set_pwr",
            SlotId::SetRfGain => "set_rf_gain",
            SlotId::SetSql => "set_sql",
            SlotId::SetNr => "set_nr",
            SlotId::SetMainVfoFreq => "set_main_vfo_freq",
            SlotId::SetSubVfoFreq => "set_sub_vfo_freq",
            SlotId::SetMode => "set_mode",
            SlotId::SetSubVfoMode => "set_sub_vfo_mode",
            SlotId::SetPtt => "set_ptt",
            SlotId::SetTune => "set_tune",
            SlotId::SetDataMode => "set_data_mode",
            SlotId::SetPreamp => "set_preamp",
            SlotId::SetAgc => "set_agc",
            SlotId::SetNrEnabled => "set_nr_enabled",
            SlotId::SetTuningStep => "set_tuning_step",
            SlotId::SetVfo => "set_vfo",
            SlotId::SetSplit => "set_split",
        }
    }
}

/// Build the full request packet for a slot: framing, addresses,
/// prefix, and data.
pub fn build_request(civ_addr: u8, controller_addr: u8, slot: SlotId, data: &[u8]) -> Vec<u8> {
    let prefix = slot.prefix();
    let mut body = Vec::with_capacity(prefix.len() + data.len());
    body.extend_from_slice(prefix);
    body.extend_from_slice(data);
    encode_packet(civ_addr, controller_addr, &body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_s_request_bytes() {
        let pkt = build_request(0xA4, 0xE0, SlotId::GetS, &[]);
        assert_eq!(pkt, vec![0xFE, 0xFE, 0xA4, 0xE0, 0x15, 0x02, 0xFD]);
    }

    #[test]
    fn set_main_vfo_freq_request_bytes() {
        // 14.250 MHz on the main VFO.
        let bcd = crate::bcd::freq_to_bcd(14_250_000);
        let pkt = build_request(0xA4, 0xE0, SlotId::SetMainVfoFreq, &bcd);
        assert_eq!(
            pkt,
            vec![0xFE, 0xFE, 0xA4, 0xE0, 0x25, 0x00, 0x00, 0x50, 0x25, 0x14, 0x00, 0xFD]
        );
    }

    #[test]
    fn ptt_and_tune_share_opcode_different_sub() {
        assert_eq!(SlotId::SetPtt.prefix(), &[0x1C, 0x00]);
        assert_eq!(SlotId::SetTune.prefix(), &[0x1C, 0x01]);
        assert_eq!(SlotId::GetTransmitStatus.prefix(), SlotId::SetPtt.prefix());
    }

    #[test]
    fn get_set_pairs_share_prefixes() {
        let pairs = [
            (SlotId::GetRfGain, SlotId::SetRfGain),
            (SlotId::GetSql, SlotId::SetSql),
            (SlotId::GetNr, SlotId::SetNr),
            (SlotId::GetPwr, SlotId::SetPwr),
            (SlotId::GetPreamp, SlotId::SetPreamp),
            (SlotId::GetAgc, SlotId::SetAgc),
            (SlotId::GetNrEnabled, SlotId::SetNrEnabled),
            (SlotId::GetMainVfoFreq, SlotId::SetMainVfoFreq),
            (SlotId::GetSubVfoFreq, SlotId::SetSubVfoFreq),
            (SlotId::GetSplit, SlotId::SetSplit),
            (SlotId::GetTuningStep, SlotId::SetTuningStep),
        ];
        for (get, set) in pairs {
            assert_eq!(get.prefix(), set.prefix(), "{} vs {}", get.name(), set.name());
        }
    }

    #[test]
    fn custom_addresses_land_in_packet() {
        let pkt = build_request(0x94, 0xE1, SlotId::GetFreq, &[]);
        assert_eq!(pkt[2], 0x94);
        assert_eq!(pkt[3], 0xE1);
    }
}
