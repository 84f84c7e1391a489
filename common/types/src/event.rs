use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// An analytics event as written to the event-log topics by the ingestion service.
///
/// The same struct is the protobuf wire message (via `prost`) and the JSON document
/// (via `serde`), so both encodings agree on field names and types. Times are
/// milliseconds since the unix epoch.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLog {
    #[prost(string, tag = "1")]
    pub event_id: String,
    #[prost(string, tag = "2")]
    pub event: String,
    #[prost(int64, tag = "3")]
    pub event_time: i64,
    #[prost(int64, tag = "4")]
    pub logged_time: i64,
    #[prost(string, tag = "5")]
    pub action_type: String,

    // App and device
    #[prost(string, tag = "6")]
    pub app_type: String,
    #[prost(string, tag = "7")]
    pub app_version: String,
    #[prost(string, tag = "8")]
    pub app_channel: String,
    #[prost(string, tag = "9")]
    pub env: String,
    #[prost(string, tag = "10")]
    pub platform: String,
    #[prost(string, tag = "11")]
    pub os: String,
    #[prost(string, tag = "12")]
    pub os_version: String,
    #[prost(string, tag = "13")]
    pub device_brand: String,
    #[prost(string, tag = "14")]
    pub device_model: String,
    #[prost(string, tag = "15")]
    pub device_vendor: String,
    #[prost(int32, tag = "16")]
    pub screen_width: i32,
    #[prost(int32, tag = "17")]
    pub screen_height: i32,
    #[prost(string, tag = "18")]
    pub screen_size: String,
    #[prost(string, tag = "19")]
    pub screen_resolution: String,
    #[prost(int32, tag = "20")]
    pub carrier: i32,
    #[prost(int32, tag = "21")]
    pub network: i32,

    // Identifiers
    #[prost(string, tag = "22")]
    pub udid: String,
    #[prost(string, tag = "23")]
    pub tkid: String,
    #[prost(string, tag = "24")]
    pub mid: String,
    #[prost(string, tag = "25")]
    pub imei: String,
    #[prost(string, tag = "26")]
    pub idfa: String,
    #[prost(string, tag = "27")]
    pub oaid: String,
    #[prost(string, tag = "28")]
    pub android_id: String,
    #[prost(string, tag = "29")]
    pub mac: String,
    #[prost(string, tag = "30")]
    pub session_id: String,

    // Page context
    #[prost(string, tag = "31")]
    pub pv_id: String,
    #[prost(string, tag = "32")]
    pub page_id: String,
    #[prost(string, tag = "33")]
    pub page_key: String,
    #[prost(string, tag = "34")]
    pub module_id: String,
    #[prost(string, tag = "35")]
    pub layout_id: String,
    #[prost(string, tag = "36")]
    pub ref_pv_id: String,
    #[prost(string, tag = "37")]
    pub ref_page_id: String,
    #[prost(string, tag = "38")]
    pub ref_page_key: String,
    #[prost(string, tag = "39")]
    pub ref_module_id: String,
    #[prost(string, tag = "40")]
    pub ref_layout_id: String,
    #[prost(int64, tag = "41")]
    pub duration: i64,

    // Filled in by the ingestion service from the request
    #[prost(string, tag = "42")]
    pub lat: String,
    #[prost(string, tag = "43")]
    pub lon: String,
    #[prost(string, tag = "44")]
    pub ip: String,
    #[prost(string, tag = "45")]
    pub ip_country: String,
    #[prost(string, tag = "46")]
    pub ip_province: String,
    #[prost(string, tag = "47")]
    pub ip_city: String,
    #[prost(string, tag = "48")]
    pub user_agent: String,
    #[prost(string, tag = "49")]
    pub referer: String,

    /// Free-form properties, kept ordered so the JSON rendering is stable.
    #[prost(btree_map = "string, string", tag = "50")]
    pub extend_info: BTreeMap<String, String>,
}
