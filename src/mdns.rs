//! Find cast devices on the local network.
//!
//! Devices answer `_googlecast._tcp.local` mDNS queries. A device whose answer
//! carries no friendly name is asked for one over HTTP; failing that it is
//! returned address-only.

use crate::{
    async_client::DEFAULT_PORT,
    error::Error,
    util::named,
};
use futures::{
    future::{BoxFuture, FutureExt},
    stream::FuturesUnordered,
    Stream, StreamExt,
};
use ::mdns::{self as mdns_lib, RecordKind};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashSet},
    fmt::Display,
    future::Future,
    net::{IpAddr, SocketAddr},
    time::Duration,
};
use tokio::{pin, time::Instant};

type Result<T, E = Error> = std::result::Result<T, E>;

/// One responding cast device.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Device {
    pub addr: SocketAddr,

    /// Friendly name, e.g. "Living Room".
    pub name: Option<String>,

    /// mDNS service instance name. `None` for devices not found by mDNS.
    pub service_host: Option<String>,

    /// App the device advertised as running.
    pub app_name: Option<String>,
    pub uuid: Option<String>,
}

pub const SERVICE_NAME: &str = "_googlecast._tcp.local";

/// How often the mDNS query is repeated while scanning.
pub const DISCOVER_INTERVAL: Duration = Duration::from_secs(1);

/// Scan time used by `resolve`.
pub const DISCOVER_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP port serving the device description.
pub const DEVICE_DESC_PORT: u16 = 8008;
pub const DEVICE_DESC_PATH: &str = "/ssdp/device-desc.xml";
pub const NAME_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
enum RecordKindVariant {
    A,
    Aaaa,
    Ptr,
    Srv,
    Txt,
}

impl RecordKindVariant {
    fn from_kind(rk: &RecordKind) -> Option<RecordKindVariant> {
        Some(match rk {
            RecordKind::A(_)       => RecordKindVariant::A,
            RecordKind::AAAA(_)    => RecordKindVariant::Aaaa,
            RecordKind::PTR(_)     => RecordKindVariant::Ptr,
            RecordKind::SRV { .. } => RecordKindVariant::Srv,
            RecordKind::TXT(_)     => RecordKindVariant::Txt,
            _ => return None,
        })
    }
}

impl Device {
    /// A device known only by address.
    pub fn from_addr(addr: SocketAddr) -> Device {
        Device {
            addr,
            name: None,
            service_host: None,
            app_name: None,
            uuid: None,
        }
    }

    /// Case-insensitive friendly name comparison.
    pub fn name_matches(&self, name: &str) -> bool {
        self.name.as_deref()
            .is_some_and(|own| own.to_lowercase() == name.to_lowercase())
    }

    /// Friendly name, or the address when there is none.
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.addr.to_string())
    }
}

/// Parse `value` as `ip:port` or a bare IP on the default port.
pub fn parse_addr(value: &str) -> Option<SocketAddr> {
    value.parse::<SocketAddr>().ok()
        .or_else(|| value.parse::<IpAddr>().ok()
                         .map(|ip| SocketAddr::from((ip, DEFAULT_PORT))))
}

/// Scan for devices for up to `time_limit`, stopping early once
/// `device_limit` devices are collected.
///
/// With `name_or_address`, a literal address is returned without scanning;
/// otherwise only devices whose friendly name matches are collected.
#[tracing::instrument(level = "debug", ret, err)]
pub async fn find(name_or_address: Option<&str>, time_limit: Duration,
                  device_limit: Option<usize>)
-> Result<Vec<Device>>
{
    if let Some(addr) = name_or_address.and_then(parse_addr) {
        return Ok(vec![Device::from_addr(addr)]);
    }

    collect_devices(time_limit, device_limit, name_or_address).await
}

/// Resolve one device, scanning for at most `DISCOVER_TIMEOUT`.
///
/// `None` picks the first device found. A value is matched against friendly
/// names, then tried as a literal address and finally as a host name.
pub async fn resolve(name_or_address: Option<&str>) -> Result<Device> {
    resolve_with_timeout(name_or_address, DISCOVER_TIMEOUT).await
}

#[tracing::instrument(level = "debug", ret, err)]
pub async fn resolve_with_timeout(name_or_address: Option<&str>, time_limit: Duration)
-> Result<Device>
{
    let found = find(name_or_address, time_limit, Some(1)).await?.into_iter().next();
    resolve_fallback(name_or_address, found).await
}

/// `found` if the scan produced a device, else `value` as a host name.
async fn resolve_fallback(name_or_address: Option<&str>, found: Option<Device>)
-> Result<Device>
{
    if let Some(device) = found {
        return Ok(device);
    }

    let Some(value) = name_or_address else {
        return Err(Error::DeviceNotFound("any device".to_string()));
    };
    let not_found = || Error::DeviceNotFound(value.to_string());

    // Literal addresses were already short-circuited by `find`.
    match tokio::net::lookup_host((value, DEFAULT_PORT)).await {
        Ok(mut addrs) => addrs.next().map(Device::from_addr).ok_or_else(not_found),
        Err(err) => {
            tracing::debug!(target: concat!(module_path!(), "::resolve_fallback"),
                            value, ?err,
                            "not a friendly name or resolvable host");
            Err(not_found())
        },
    }
}

async fn collect_devices(time_limit: Duration, device_limit: Option<usize>,
                         name: Option<&str>)
-> Result<Vec<Device>>
{
    let deadline = Instant::now() + time_limit;

    let responses = mdns_lib::discover::all(SERVICE_NAME, DISCOVER_INTERVAL)
        .map_err(|err| Error::Discovery(err.to_string()))?
        .listen();

    Ok(collect_from(responses, deadline, device_limit, name, fetch_friendly_name).await)
}

/// Unique devices by address from a stream of mDNS responses, collected
/// until `deadline` or until `device_limit` are found.
///
/// Devices answering without a friendly name are looked up with
/// `lookup_name` while the stream keeps being read. When `name` is given only
/// matching devices are kept; otherwise a device whose lookup is still
/// pending at the deadline is returned address-only.
#[named]
async fn collect_from<S, E, L, F>(responses: S, deadline: Instant, device_limit: Option<usize>,
                                  name: Option<&str>, lookup_name: L)
-> Vec<Device>
where S: Stream<Item = Result<mdns_lib::Response, E>>,
      E: Display,
      L: Fn(IpAddr) -> F,
      F: Future<Output = Option<String>> + Send + 'static,
{
    const FUNCTION_PATH: &str = function_path!();

    pin!(responses);

    let mut devices = Vec::<Device>::new();
    let mut seen = HashSet::<SocketAddr>::new();
    let mut pending = Vec::<Device>::new();
    let mut lookups = FuturesUnordered::<BoxFuture<'static, (SocketAddr, Option<String>)>>::new();
    let mut responses_done = false;

    let is_full = |found: usize| device_limit.is_some_and(|limit| found >= limit);

    while !is_full(devices.len()) && !(responses_done && lookups.is_empty()) {
        let mut candidates = Vec::<Device>::new();

        tokio::select! {
            () = tokio::time::sleep_until(deadline) => {
                tracing::debug!(target: FUNCTION_PATH,
                                found = devices.len(),
                                pending = pending.len(),
                                "scan time limit reached");
                break;
            },

            Some((addr, looked_up)) = lookups.next(), if !lookups.is_empty() => {
                let pos = pending.iter().position(|d: &Device| d.addr == addr);
                if let Some(mut device) = pos.map(|pos| pending.remove(pos)) {
                    device.name = looked_up;
                    candidates.push(device);
                }
            },

            resp = responses.next(), if !responses_done => match resp {
                None => responses_done = true,
                Some(Err(err)) => {
                    tracing::warn!(target: FUNCTION_PATH,
                                   %err,
                                   "mdns receive error");
                },
                Some(Ok(resp)) => {
                    for device in devices_from_mdns_response(&resp) {
                        if !seen.insert(device.addr) {
                            continue;
                        }
                        if device.name.is_some() {
                            candidates.push(device);
                            continue;
                        }
                        let addr = device.addr;
                        let lookup = lookup_name(addr.ip());
                        lookups.push(async move { (addr, lookup.await) }.boxed());
                        pending.push(device);
                    }
                },
            },
        }

        for device in candidates {
            if is_full(devices.len()) {
                break;
            }
            if name.is_some_and(|name| !device.name_matches(name)) {
                tracing::trace!(target: FUNCTION_PATH,
                                ?device,
                                "name does not match");
                continue;
            }
            tracing::debug!(target: FUNCTION_PATH,
                            ?device,
                            "device found");
            devices.push(device);
        }
    }

    if name.is_none() {
        for device in pending {
            if is_full(devices.len()) {
                break;
            }
            devices.push(device);
        }
    }

    devices
}

/// Devices described by one mDNS response. A device's records may be split
/// across answers and additional records.
#[named]
pub fn devices_from_mdns_response(resp: &mdns_lib::Response) -> Vec<Device> {
    const FUNCTION_PATH: &str = function_path!();

    tracing::trace!(target: FUNCTION_PATH,
                    answers_len = resp.answers.len(),
                    additional_len = resp.additional.len(),
                    "mdns::Response");

    let mut recs = RecordMap::new();

    for rec in resp.answers.iter().chain(resp.additional.iter()) {
        let Some(variant) = RecordKindVariant::from_kind(&rec.kind) else {
            continue;
        };
        recs.entry((rec.name.clone(), variant)).or_default().push(&rec.kind);
    }

    let mut devices = Vec::new();

    for ptr in records(&recs, SERVICE_NAME, RecordKindVariant::Ptr) {
        let RecordKind::PTR(service_host) = ptr else { continue };

        let Some((target, port)) = records(&recs, service_host, RecordKindVariant::Srv).into_iter()
            .find_map(|kind| match kind {
                RecordKind::SRV { target, port, .. } => Some((target.as_str(), *port)),
                _ => None,
            })
        else {
            tracing::trace!(target: FUNCTION_PATH,
                            service_host,
                            "no SRV record");
            continue;
        };

        let ip: Option<IpAddr> = records(&recs, target, RecordKindVariant::A).into_iter()
            .find_map(|kind| match kind {
                RecordKind::A(ipv4) => Some(IpAddr::from(*ipv4)),
                _ => None,
            })
            .or_else(|| records(&recs, target, RecordKindVariant::Aaaa).into_iter()
                .find_map(|kind| match kind {
                    RecordKind::AAAA(ipv6) => Some(IpAddr::from(*ipv6)),
                    _ => None,
                }));

        let Some(ip) = ip else {
            tracing::trace!(target: FUNCTION_PATH,
                            service_host, target,
                            "no address record");
            continue;
        };

        let mut device = Device::from_addr(SocketAddr::from((ip, port)));
        device.service_host = Some(service_host.clone());

        let txt_entries = records(&recs, service_host, RecordKindVariant::Txt).into_iter()
            .filter_map(|kind| match kind {
                RecordKind::TXT(entries) => Some(entries),
                _ => None,
            })
            .flatten();

        for entry in txt_entries {
            let Some((k, v)) = entry.split_once('=') else {
                continue;
            };

            match k {
                "fn" => device.name = Some(v.to_string()),
                "rs" => device.app_name = Some(v.to_string()),
                "id" => device.uuid = Some(v.to_string()),
                _ => (),
            }
        }

        devices.push(device);
    }

    devices
}

type RecordMap<'a> = BTreeMap<(String, RecordKindVariant), Vec<&'a RecordKind>>;

fn records<'a>(recs: &RecordMap<'a>, name: &str, variant: RecordKindVariant)
-> Vec<&'a RecordKind>
{
    recs.get(&(name.to_string(), variant)).cloned().unwrap_or_default()
}

/// Ask the device for its friendly name. Failures are logged, not returned.
#[named]
async fn fetch_friendly_name(ip: IpAddr) -> Option<String> {
    const FUNCTION_PATH: &str = function_path!();

    let url = format!("http://{addr}{DEVICE_DESC_PATH}",
                      addr = SocketAddr::from((ip, DEVICE_DESC_PORT)));

    let res: Result<String, reqwest::Error> = async {
        let http = reqwest::Client::builder()
            .timeout(NAME_LOOKUP_TIMEOUT)
            .build()?;
        http.get(&url).send().await?
            .error_for_status()?
            .text().await
    }.await;

    match res {
        Ok(xml) => {
            let name = friendly_name_from_device_desc(&xml);
            if name.is_none() {
                tracing::warn!(target: FUNCTION_PATH,
                               %url,
                               "device description has no friendlyName");
            }
            name
        },
        Err(err) => {
            tracing::warn!(target: FUNCTION_PATH,
                           %url, %err,
                           "friendly name lookup failed");
            None
        },
    }
}

#[derive(Debug, Deserialize)]
struct DeviceDesc {
    #[serde(default)]
    device: Option<DeviceDescDevice>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceDescDevice {
    #[serde(default)]
    friendly_name: Option<DeviceDescText>,
}

#[derive(Debug, Deserialize)]
struct DeviceDescText {
    #[serde(rename = "$text", default)]
    text: String,
}

/// `device/friendlyName` of a UPnP device description.
pub fn friendly_name_from_device_desc(xml: &str) -> Option<String> {
    let desc: DeviceDesc = match quick_xml::de::from_str(xml) {
        Ok(desc) => desc,
        Err(err) => {
            tracing::debug!(target: concat!(module_path!(), "::friendly_name_from_device_desc"),
                            %err,
                            "unparseable device description");
            return None;
        },
    };

    let name = desc.device?.friendly_name?.text.trim().to_string();
    (!name.is_empty()).then_some(name)
}
