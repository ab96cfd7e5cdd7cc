//! Binary envelope codec for the PowerStream local MQTT protocol.
//!
//! Every message on the device broker is a protobuf `HeaderMessage` holding
//! one or more `Header`s. A header routes its nested `pdata` payload by
//! `cmd_func`/`cmd_id`; the only payload decoded here is the inverter status
//! report (`cmd_id == 1`). Outbound, the bridge only ever sends two kinds of
//! frames: the permanent output setpoint and the keep-alive heartbeat.

use std::time::{SystemTime, UNIX_EPOCH};

use protobuf::Message;
use thiserror::Error;

use crate::protos::powerstream::{Header, HeaderMessage, InverterHeartbeat, PermanentWattsPack};

/// `cmd_id` of the periodic inverter status report.
pub const CMD_ID_INVERTER_HEARTBEAT: i32 = 1;

const APP_SRC: i32 = 32;
const INVERTER_DEST: i32 = 53;
const CHECK_TYPE: i32 = 3;
const PROTOCOL_VERSION: i32 = 3;
const PAYLOAD_VERSION: i32 = 1;
const FROM_APP: &str = "ios";

const SET_POWER_CMD_FUNC: i32 = 20;
const SET_POWER_CMD_ID: i32 = 129;

const HEARTBEAT_CMD_FUNC: i32 = 32;
const HEARTBEAT_CMD_ID: i32 = 11;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] protobuf::Error),
}

/// One routed sub-message of an envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubHeader {
    pub cmd_func: i32,
    pub cmd_id: i32,
    pub src: i32,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Frame {
    pub headers: Vec<SubHeader>,
}

impl Frame {
    /// Sub-headers carrying an inverter status report, in receipt order.
    pub fn heartbeats(&self) -> impl Iterator<Item = &SubHeader> {
        self.headers
            .iter()
            .filter(|header| header.cmd_id == CMD_ID_INVERTER_HEARTBEAT)
    }
}

/// Decoded inverter status. All values are the raw x10 fixed-point integers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InverterStatus {
    pub inv_output_watts: i32,
    pub permanent_watts: u32,
    pub llc_temp: i32,
    pub pv1_input_volt: i32,
    pub pv1_input_cur: i32,
    pub pv2_input_volt: i32,
    pub pv2_input_cur: i32,
}

impl InverterStatus {
    pub fn output_watts(&self) -> i32 {
        (self.inv_output_watts / 10).max(0)
    }

    pub fn avg_pv_voltage(&self) -> f64 {
        f64::from(self.pv1_input_volt + self.pv2_input_volt) / 20.0
    }

    pub fn to_json_payload(&self, last_updated: i64) -> serde_json::Value {
        serde_json::json!({
            "invOutputWatts": f64::from(self.inv_output_watts) / 10.0,
            "llcTemp": f64::from(self.llc_temp) / 10.0,
            "permanentWatts": f64::from(self.permanent_watts) / 10.0,
            "pv1InputVolt": f64::from(self.pv1_input_volt) / 10.0,
            "pv1InputCur": f64::from(self.pv1_input_cur) / 10.0,
            "pv2InputVolt": f64::from(self.pv2_input_volt) / 10.0,
            "pv2InputCur": f64::from(self.pv2_input_cur) / 10.0,
            "last_updated": last_updated,
        })
    }
}

impl From<&InverterHeartbeat> for InverterStatus {
    fn from(heartbeat: &InverterHeartbeat) -> Self {
        Self {
            inv_output_watts: heartbeat.inv_output_watts,
            permanent_watts: heartbeat.permanent_watts,
            llc_temp: heartbeat.llc_temp,
            pv1_input_volt: heartbeat.pv1_input_volt,
            pv1_input_cur: heartbeat.pv1_input_cur,
            pv2_input_volt: heartbeat.pv2_input_volt,
            pv2_input_cur: heartbeat.pv2_input_cur,
        }
    }
}

pub fn decode_envelope(bytes: &[u8]) -> Result<Frame, DecodeError> {
    let message = HeaderMessage::parse_from_bytes(bytes)?;
    let headers = message
        .header
        .into_iter()
        .map(|header| SubHeader {
            cmd_func: header.cmd_func,
            cmd_id: header.cmd_id,
            src: header.src,
            payload: header.pdata,
        })
        .collect();
    Ok(Frame { headers })
}

/// An empty payload is a report with every field at zero.
pub fn decode_inverter_status(payload: &[u8]) -> Result<InverterStatus, DecodeError> {
    let heartbeat = InverterHeartbeat::parse_from_bytes(payload)?;
    Ok(InverterStatus::from(&heartbeat))
}

/// Decodes a full upstream message down to the most recent status report.
///
/// Returns `Ok(None)` for well-formed frames that carry no status report.
/// A malformed status payload fails the whole frame; no partial telemetry is
/// produced.
pub fn decode_telemetry(bytes: &[u8]) -> Result<Option<InverterStatus>, DecodeError> {
    let frame = decode_envelope(bytes)?;
    match frame.heartbeats().last() {
        Some(header) => decode_inverter_status(&header.payload).map(Some),
        None => Ok(None),
    }
}

/// Current Unix time in seconds, used as the frame sequence number.
pub fn sequence_now() -> i32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| sequence_from_secs(elapsed.as_secs()))
        .unwrap_or_default()
}

/// `seq` is an int32 on the wire; saturates instead of wrapping past 2038.
pub fn sequence_from_secs(secs: u64) -> i32 {
    i32::try_from(secs).unwrap_or(i32::MAX)
}

pub fn deci_watts(watts: i32) -> u32 {
    watts.saturating_mul(10).max(1) as u32
}

pub fn encode_set_power(watts: i32, device_sn: &str) -> protobuf::Result<Vec<u8>> {
    encode_set_power_at(watts, device_sn, sequence_now())
}

pub fn encode_set_power_at(watts: i32, device_sn: &str, seq: i32) -> protobuf::Result<Vec<u8>> {
    let deci_watts = deci_watts(watts);

    let mut pack = PermanentWattsPack::new();
    pack.permanent_watts = deci_watts;

    let mut header = routed_header(INVERTER_DEST, seq);
    header.pdata = pack.write_to_bytes()?;
    header.cmd_func = SET_POWER_CMD_FUNC;
    header.cmd_id = SET_POWER_CMD_ID;
    // the varint of the value needs a second byte above 127
    header.data_len = if deci_watts > 127 { 3 } else { 2 };
    header.need_ack = 1;
    header.device_sn = device_sn.to_string();

    envelope(header)
}

pub fn encode_heartbeat() -> protobuf::Result<Vec<u8>> {
    encode_heartbeat_at(sequence_now())
}

pub fn encode_heartbeat_at(seq: i32) -> protobuf::Result<Vec<u8>> {
    let mut header = routed_header(APP_SRC, seq);
    header.cmd_func = HEARTBEAT_CMD_FUNC;
    header.cmd_id = HEARTBEAT_CMD_ID;

    envelope(header)
}

fn routed_header(dest: i32, seq: i32) -> Header {
    let mut header = Header::new();
    header.src = APP_SRC;
    header.dest = dest;
    header.d_src = 1;
    header.d_dest = 1;
    header.check_type = CHECK_TYPE;
    header.version = PROTOCOL_VERSION;
    header.payload_ver = PAYLOAD_VERSION;
    header.from = FROM_APP.to_string();
    header.seq = seq;
    header
}

fn envelope(header: Header) -> protobuf::Result<Vec<u8>> {
    let mut message = HeaderMessage::new();
    message.header.push(header);
    message.write_to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn only_header(bytes: &[u8]) -> Header {
        let mut message = HeaderMessage::parse_from_bytes(bytes).unwrap();
        assert_eq!(message.header.len(), 1);
        message.header.remove(0)
    }

    fn telemetry_frame(heartbeat: &InverterHeartbeat) -> Vec<u8> {
        let mut header = Header::new();
        header.cmd_func = 20;
        header.cmd_id = CMD_ID_INVERTER_HEARTBEAT;
        header.src = 53;
        header.pdata = heartbeat.write_to_bytes().unwrap();
        let mut message = HeaderMessage::new();
        message.header.push(header);
        message.write_to_bytes().unwrap()
    }

    #[test]
    fn set_power_uses_two_byte_payload_up_to_127_deciwatts() {
        for watts in [0, 1, 12] {
            let header = only_header(&encode_set_power_at(watts, "HW51TEST", 1000).unwrap());
            assert_eq!(header.data_len, 2, "watts={watts}");
            let pack = PermanentWattsPack::parse_from_bytes(&header.pdata).unwrap();
            assert_eq!(pack.permanent_watts, deci_watts(watts));
            assert_eq!(header.pdata.len(), 2);
        }
    }

    #[test]
    fn set_power_uses_three_byte_payload_above_127_deciwatts() {
        for watts in [13, 400, 799] {
            let header = only_header(&encode_set_power_at(watts, "HW51TEST", 1000).unwrap());
            assert_eq!(header.data_len, 3, "watts={watts}");
            let pack = PermanentWattsPack::parse_from_bytes(&header.pdata).unwrap();
            assert_eq!(pack.permanent_watts, (watts * 10) as u32);
        }
    }

    #[test]
    fn set_power_never_sends_zero() {
        assert_eq!(deci_watts(0), 1);
        assert_eq!(deci_watts(-20), 1);
        assert_eq!(deci_watts(42), 420);
    }

    #[test]
    fn set_power_routing_fields() {
        let header = only_header(&encode_set_power_at(200, "HW51TEST", 1_700_000_000).unwrap());
        assert_eq!(header.src, 32);
        assert_eq!(header.dest, 53);
        assert_eq!(header.d_src, 1);
        assert_eq!(header.d_dest, 1);
        assert_eq!(header.check_type, 3);
        assert_eq!(header.cmd_func, 20);
        assert_eq!(header.cmd_id, 129);
        assert_eq!(header.need_ack, 1);
        assert_eq!(header.version, 3);
        assert_eq!(header.payload_ver, 1);
        assert_eq!(header.from, "ios");
        assert_eq!(header.device_sn, "HW51TEST");
        assert_eq!(header.seq, 1_700_000_000);
    }

    #[test]
    fn set_power_is_deterministic_for_a_given_tick() {
        assert_eq!(
            encode_set_power_at(321, "HW51TEST", 42).unwrap(),
            encode_set_power_at(321, "HW51TEST", 42).unwrap()
        );
    }

    #[test]
    fn heartbeat_has_no_payload() {
        let header = only_header(&encode_heartbeat_at(77).unwrap());
        assert!(header.pdata.is_empty());
        assert_eq!(header.data_len, 0);
        assert_eq!(header.cmd_func, 32);
        assert_eq!(header.cmd_id, 11);
        assert_eq!(header.seq, 77);
        assert!(header.device_sn.is_empty());
    }

    #[test]
    fn decodes_inverter_status() {
        let mut heartbeat = InverterHeartbeat::new();
        heartbeat.inv_output_watts = 2345;
        heartbeat.permanent_watts = 2400;
        heartbeat.llc_temp = 412;
        heartbeat.pv1_input_volt = 301;
        heartbeat.pv1_input_cur = 45;
        heartbeat.pv2_input_volt = 299;
        heartbeat.pv2_input_cur = 40;

        let status = decode_telemetry(&telemetry_frame(&heartbeat))
            .unwrap()
            .unwrap();
        assert_eq!(status.inv_output_watts, 2345);
        assert_eq!(status.output_watts(), 234);
        assert_eq!(status.avg_pv_voltage(), 30.0);

        let json = status.to_json_payload(1234);
        assert_eq!(json["invOutputWatts"], 234.5);
        assert_eq!(json["llcTemp"], 41.2);
        assert_eq!(json["permanentWatts"], 240.0);
        assert_eq!(json["pv2InputCur"], 4.0);
        assert_eq!(json["last_updated"], 1234);
    }

    #[test]
    fn other_command_ids_carry_no_telemetry() {
        let mut header = Header::new();
        header.cmd_id = 136;
        header.pdata = vec![0x08, 0x01];
        let mut message = HeaderMessage::new();
        message.header.push(header);

        let frame = decode_envelope(&message.write_to_bytes().unwrap()).unwrap();
        assert_eq!(frame.headers.len(), 1);
        assert_eq!(frame.heartbeats().count(), 0);
        assert!(decode_telemetry(&message.write_to_bytes().unwrap())
            .unwrap()
            .is_none());
    }

    #[test]
    fn garbage_is_malformed() {
        // field 1, length-delimited, claims 100 bytes but only 2 follow
        let result = decode_envelope(&[0x0a, 0x64, 0x01, 0x02]);
        assert!(matches!(result, Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn empty_status_payload_is_an_all_zero_report() {
        // proto3 writes a report with only default fields as zero bytes
        assert!(InverterHeartbeat::new().write_to_bytes().unwrap().is_empty());

        let mut header = Header::new();
        header.cmd_id = CMD_ID_INVERTER_HEARTBEAT;
        let mut message = HeaderMessage::new();
        message.header.push(header);

        let status = decode_telemetry(&message.write_to_bytes().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(status, InverterStatus::default());
        assert_eq!(status.output_watts(), 0);
    }

    #[test]
    fn sequence_saturates_past_i32() {
        assert_eq!(sequence_from_secs(1_700_000_000), 1_700_000_000);
        assert_eq!(sequence_from_secs(i32::MAX as u64), i32::MAX);
        assert_eq!(sequence_from_secs(2_200_000_000), i32::MAX);
        assert!(sequence_now() > 0);
    }

    #[test]
    fn command_frames_do_not_decode_as_telemetry() {
        let bytes = encode_set_power_at(100, "HW51TEST", 5).unwrap();
        assert!(decode_telemetry(&bytes).unwrap().is_none());
    }
}
