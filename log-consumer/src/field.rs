//! Name-addressable access to `EventLog` fields.
//!
//! Names are matched case-insensitively with `_` and `-` ignored, so `event_id`,
//! `EventId` and `event-id` all address the same field. `extend_info.<key>`
//! reads a single entry of the extension map, `extend_info.` the whole map.
use chrono::DateTime;
use common_types::EventLog;

use crate::error::MarshalError;

const DATE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const DATE_FORMAT: &str = "%Y%m%d";

#[derive(Clone)]
enum Accessor {
    Text(fn(&EventLog) -> &str),
    Number(fn(&EventLog) -> i64),
    DateTime(fn(&EventLog) -> i64),
    Date(fn(&EventLog) -> i64),
    ExtendInfo,
    ExtendKey(String),
}

/// A resolved field name, ready to read values off events.
#[derive(Clone)]
pub struct Field {
    accessor: Accessor,
}

impl Field {
    /// Resolve `name`. Fails for names that address no field.
    pub fn resolve(name: &str) -> Result<Self, MarshalError> {
        let unknown = || MarshalError::UnknownField(name.to_string());

        let accessor = match name.split_once('.') {
            None => accessor_for(&normalize(name)).ok_or_else(unknown)?,
            Some((namespace, key)) => {
                if key.contains('.') || normalize(namespace) != "extendinfo" {
                    return Err(unknown());
                }
                if key.is_empty() {
                    Accessor::ExtendInfo
                } else {
                    Accessor::ExtendKey(key.to_string())
                }
            }
        };

        Ok(Self { accessor })
    }

    /// Render the field of `event`. Absent values render as the empty string.
    pub fn value(&self, event: &EventLog) -> String {
        match &self.accessor {
            Accessor::Text(get) => get(event).to_string(),
            Accessor::Number(get) => get(event).to_string(),
            Accessor::DateTime(get) => format_millis(get(event), DATE_TIME_FORMAT),
            Accessor::Date(get) => format_millis(get(event), DATE_FORMAT),
            Accessor::ExtendInfo => {
                serde_json::to_string(&event.extend_info).unwrap_or_else(|_| "{}".to_string())
            }
            Accessor::ExtendKey(key) => event.extend_info.get(key).cloned().unwrap_or_default(),
        }
    }
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

// Millisecond epoch, truncated to whole seconds, in UTC
fn format_millis(millis: i64, format: &str) -> String {
    DateTime::from_timestamp(millis / 1000, 0)
        .map(|time| time.format(format).to_string())
        .unwrap_or_default()
}

fn accessor_for(normalized: &str) -> Option<Accessor> {
    let accessor = match normalized {
        "actiontype" => Accessor::Text(|e| e.action_type.as_str()),
        "androidid" => Accessor::Text(|e| e.android_id.as_str()),
        "appchannel" => Accessor::Text(|e| e.app_channel.as_str()),
        "apptype" => Accessor::Text(|e| e.app_type.as_str()),
        "appversion" => Accessor::Text(|e| e.app_version.as_str()),
        "carrier" => Accessor::Number(|e| i64::from(e.carrier)),
        "devicebrand" => Accessor::Text(|e| e.device_brand.as_str()),
        "devicemodel" => Accessor::Text(|e| e.device_model.as_str()),
        "devicevendor" => Accessor::Text(|e| e.device_vendor.as_str()),
        "duration" => Accessor::Number(|e| e.duration),
        "env" => Accessor::Text(|e| e.env.as_str()),
        "event" => Accessor::Text(|e| e.event.as_str()),
        "eventid" => Accessor::Text(|e| e.event_id.as_str()),
        "eventtime" => Accessor::Number(|e| e.event_time),
        "eventtimestr" => Accessor::DateTime(|e| e.event_time),
        "extendinfo" => Accessor::ExtendInfo,
        "idfa" => Accessor::Text(|e| e.idfa.as_str()),
        "imei" => Accessor::Text(|e| e.imei.as_str()),
        "ip" => Accessor::Text(|e| e.ip.as_str()),
        "ipcity" => Accessor::Text(|e| e.ip_city.as_str()),
        "ipcountry" => Accessor::Text(|e| e.ip_country.as_str()),
        "ipprovince" => Accessor::Text(|e| e.ip_province.as_str()),
        "lat" => Accessor::Text(|e| e.lat.as_str()),
        "layoutid" => Accessor::Text(|e| e.layout_id.as_str()),
        "loggeddate" => Accessor::Date(|e| e.logged_time),
        "loggedtime" => Accessor::Number(|e| e.logged_time),
        "loggedtimestr" => Accessor::DateTime(|e| e.logged_time),
        "lon" => Accessor::Text(|e| e.lon.as_str()),
        "mac" => Accessor::Text(|e| e.mac.as_str()),
        "mid" => Accessor::Text(|e| e.mid.as_str()),
        "moduleid" => Accessor::Text(|e| e.module_id.as_str()),
        "network" => Accessor::Number(|e| i64::from(e.network)),
        "oaid" => Accessor::Text(|e| e.oaid.as_str()),
        "os" => Accessor::Text(|e| e.os.as_str()),
        "osversion" => Accessor::Text(|e| e.os_version.as_str()),
        "pageid" => Accessor::Text(|e| e.page_id.as_str()),
        "pagekey" => Accessor::Text(|e| e.page_key.as_str()),
        "platform" => Accessor::Text(|e| e.platform.as_str()),
        "pvid" => Accessor::Text(|e| e.pv_id.as_str()),
        "referer" => Accessor::Text(|e| e.referer.as_str()),
        "reflayoutid" => Accessor::Text(|e| e.ref_layout_id.as_str()),
        "refmoduleid" => Accessor::Text(|e| e.ref_module_id.as_str()),
        "refpageid" => Accessor::Text(|e| e.ref_page_id.as_str()),
        "refpagekey" => Accessor::Text(|e| e.ref_page_key.as_str()),
        "refpvid" => Accessor::Text(|e| e.ref_pv_id.as_str()),
        "screenheight" => Accessor::Number(|e| i64::from(e.screen_height)),
        "screenresolution" => Accessor::Text(|e| e.screen_resolution.as_str()),
        "screensize" => Accessor::Text(|e| e.screen_size.as_str()),
        "screenwidth" => Accessor::Number(|e| i64::from(e.screen_width)),
        "sessionid" => Accessor::Text(|e| e.session_id.as_str()),
        "tkid" => Accessor::Text(|e| e.tkid.as_str()),
        "udid" => Accessor::Text(|e| e.udid.as_str()),
        "useragent" => Accessor::Text(|e| e.user_agent.as_str()),
        _ => return None,
    };
    Some(accessor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> EventLog {
        let mut event = EventLog {
            event_id: "e-1".to_string(),
            event: "page_view".to_string(),
            screen_width: 1080,
            carrier: -1,
            duration: 1500,
            // 2021-03-04T05:06:07.890Z
            event_time: 1_614_834_367_890,
            logged_time: 1_614_834_367_000,
            ..Default::default()
        };
        event.extend_info.insert("b".to_string(), "2".to_string());
        event.extend_info.insert("a".to_string(), "x\"y".to_string());
        event
    }

    #[test]
    fn names_are_normalized() {
        let event = event();
        let test_cases = vec![
            ("event_id", "e-1"),
            ("EventId", "e-1"),
            ("event-id", "e-1"),
            ("EVENT", "page_view"),
            ("screen_width", "1080"),
            ("carrier", "-1"),
            ("duration", "1500"),
            ("event_time", "1614834367890"),
            ("udid", ""),
        ];

        for (name, expected) in test_cases {
            let field = Field::resolve(name).expect(name);
            assert_eq!(field.value(&event), expected, "name={name}");
        }
    }

    #[test]
    fn derived_time_fields_are_utc() {
        let event = event();
        let test_cases = vec![
            ("event_time_str", "2021-03-04T05:06:07"),
            ("logged_time_str", "2021-03-04T05:06:07"),
            ("logged_date", "20210304"),
        ];

        for (name, expected) in test_cases {
            let field = Field::resolve(name).expect(name);
            assert_eq!(field.value(&event), expected, "name={name}");
        }

        let zero = EventLog::default();
        assert_eq!(
            Field::resolve("logged_date").unwrap().value(&zero),
            "19700101"
        );
    }

    #[test]
    fn extend_info_renders_map_or_key() {
        let event = event();

        let whole = Field::resolve("extend_info").unwrap();
        assert_eq!(whole.value(&event), r#"{"a":"x\"y","b":"2"}"#);
        assert_eq!(whole.value(&EventLog::default()), "{}");

        let key = Field::resolve("extend_info.b").unwrap();
        assert_eq!(key.value(&event), "2");
        let missing = Field::resolve("ExtendInfo.missing").unwrap();
        assert_eq!(missing.value(&event), "");

        let empty_key = Field::resolve("extend_info.").unwrap();
        assert_eq!(empty_key.value(&event), r#"{"a":"x\"y","b":"2"}"#);
    }

    #[test]
    fn unknown_names_fail_resolution() {
        let test_cases = vec!["nope", "event_id.key", "extend_info.a.b", "", "."];

        for name in test_cases {
            assert!(
                matches!(Field::resolve(name), Err(MarshalError::UnknownField(_))),
                "name={name}"
            );
        }
    }
}
