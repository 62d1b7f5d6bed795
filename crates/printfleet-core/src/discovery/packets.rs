// ── Discovery packet parsing ──
//
// Pure functions: datagram in, candidate printer addresses out. The
// receive loops in `listener` stay free of protocol detail.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use roxmltree::Document;
use simple_dns::Packet;
use simple_dns::rdata::RData;
use url::Url;

/// mDNS service types advertised by network printers.
pub const PRINTER_SERVICE_TYPES: [&str; 4] = ["_ipp._tcp", "_ipps._tcp", "_printer._tcp", "_pdl-datastream._tcp"];

/// Device types that answer SSDP but are never printers.
const SSDP_NON_PRINTER_TYPES: [&str; 12] = [
    "internetgatewaydevice",
    "wanconnectiondevice",
    "wandevice",
    "wanipconnection",
    "wanpppconnection",
    "wancommoninterfaceconfig",
    "wanethernetlinkconfig",
    "layer3forwarding",
    "mediarenderer",
    "mediaserver",
    "dial",
    "upnp:rootdevice",
];

const LLMNR_PRINTER_KEYWORDS: [&str; 18] = [
    "print", "printer", "mfp", "copier", "scanner", "hp", "canon", "epson", "brother", "xerox",
    "ricoh", "laserjet", "deskjet", "officejet", "colorjet", "bizhub", "imagerunner", "workcentre",
];

const LLMNR_PRINTER_PREFIXES: [&str; 2] = ["prn-", "mfp-"];

// ── mDNS ─────────────────────────────────────────────────────────────

/// Whether an mDNS datagram mentions a printer service anywhere in its
/// questions, answers, or additional records.
pub fn mdns_mentions_printer(datagram: &[u8]) -> bool {
    let Ok(packet) = Packet::parse(datagram) else {
        return false;
    };

    let mut names: Vec<String> = packet.questions.iter().map(|q| q.qname.to_string()).collect();
    for record in packet.answers.iter().chain(&packet.additional_records) {
        names.push(record.name.to_string());
        if let RData::PTR(ptr) = &record.rdata {
            names.push(ptr.0.to_string());
        }
    }

    names.iter().any(|name| {
        let name = name.to_ascii_lowercase();
        PRINTER_SERVICE_TYPES.iter().any(|svc| name.contains(svc))
    })
}

// ── LLMNR ────────────────────────────────────────────────────────────

/// Names asked for in an LLMNR query.
pub fn llmnr_query_names(datagram: &[u8]) -> Vec<String> {
    Packet::parse(datagram)
        .map(|packet| packet.questions.iter().map(|q| q.qname.to_string()).collect())
        .unwrap_or_default()
}

/// Heuristic for hostnames that usually belong to printers.
pub fn looks_like_printer_name(name: &str) -> bool {
    let name = name.trim_end_matches('.').to_ascii_lowercase();
    let name = name.strip_suffix(".local").unwrap_or(&name);
    if name.is_empty() {
        return false;
    }
    LLMNR_PRINTER_PREFIXES.iter().any(|p| name.starts_with(p))
        || LLMNR_PRINTER_KEYWORDS.iter().any(|k| name.contains(k))
}

// ── SSDP ─────────────────────────────────────────────────────────────

/// Addresses worth enriching from one SSDP datagram: the sender, plus
/// the `LOCATION` host when it differs.
pub fn ssdp_addresses(payload: &str, source: Ipv4Addr) -> Vec<Ipv4Addr> {
    let mut lines = payload.lines();
    let start = lines.next().unwrap_or_default().trim().to_ascii_uppercase();

    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_owned()))
        .collect();
    let header = |name: &str| headers.get(name).map(String::as_str).unwrap_or_default();

    let announced = if start.starts_with("NOTIFY") {
        header("nts").eq_ignore_ascii_case("ssdp:alive")
    } else {
        start.starts_with("HTTP/1.1 200")
    };
    if !announced {
        return Vec::new();
    }

    let kind = format!("{} {} {}", header("nt"), header("st"), header("usn")).to_ascii_lowercase();
    if SSDP_NON_PRINTER_TYPES.iter().any(|t| kind.contains(t)) {
        return Vec::new();
    }

    let mut out = vec![source];
    if let Some(ip) = url_ipv4(header("location")) {
        if ip != source {
            out.push(ip);
        }
    }
    out
}

/// `M-SEARCH` for printers, sent once when the SSDP listener starts.
pub fn ssdp_search_request() -> Vec<u8> {
    concat!(
        "M-SEARCH * HTTP/1.1\r\n",
        "HOST: 239.255.255.250:1900\r\n",
        "MAN: \"ssdp:discover\"\r\n",
        "MX: 2\r\n",
        "ST: urn:schemas-upnp-org:device:Printer:1\r\n",
        "\r\n"
    )
    .as_bytes()
    .to_vec()
}

// ── WS-Discovery ─────────────────────────────────────────────────────

/// Prefixes bound when a device sends WS-Discovery XML without declaring
/// its namespaces.
const WSD_FALLBACK_NAMESPACES: &str = concat!(
    r#"xmlns:soap="http://www.w3.org/2003/05/soap-envelope" "#,
    r#"xmlns:s12="http://www.w3.org/2003/05/soap-envelope" "#,
    r#"xmlns:wsa="http://schemas.xmlsoap.org/ws/2004/08/addressing" "#,
    r#"xmlns:wsd="http://schemas.xmlsoap.org/ws/2005/04/discovery" "#,
    r#"xmlns:wsdp="http://schemas.xmlsoap.org/ws/2006/02/devprof" "#,
    r#"xmlns:wprt="http://schemas.microsoft.com/windows/2006/08/wdp/print""#,
);

const WSD_FRAME: &str = "wsd-frame";

/// Body elements that announce a live device.
const WSD_ANNOUNCEMENTS: [&str; 3] = ["Hello", "ProbeMatches", "ProbeMatch"];

/// IPv4 hosts from the `XAddrs` of a `Hello` or `ProbeMatch` message.
///
/// The message kind is the first element inside `Body` (or the top-level
/// element for a bare fragment), matched by local name.
pub fn wsd_addresses(payload: &str) -> Vec<Ipv4Addr> {
    let xml = strip_xml_declaration(payload);
    let framed;
    let doc = match Document::parse(xml) {
        Ok(doc) => doc,
        Err(_) => {
            framed = format!("<{WSD_FRAME} {WSD_FALLBACK_NAMESPACES}>{xml}</{WSD_FRAME}>");
            match Document::parse(&framed) {
                Ok(doc) => doc,
                Err(_) => return Vec::new(),
            }
        }
    };

    let root = doc.root_element();
    let message = match root.descendants().find(|n| n.tag_name().name() == "Body") {
        Some(body) => body.first_element_child(),
        None if root.tag_name().name() == WSD_FRAME => root.first_element_child(),
        None => Some(root),
    };
    let Some(message) = message else {
        return Vec::new();
    };
    if !WSD_ANNOUNCEMENTS.contains(&message.tag_name().name()) {
        return Vec::new();
    }

    let mut out = Vec::new();
    let xaddrs = message
        .descendants()
        .filter(|n| n.tag_name().name() == "XAddrs")
        .filter_map(|n| n.text());
    for ip in xaddrs.flat_map(str::split_whitespace).filter_map(url_ipv4) {
        if !out.contains(&ip) {
            out.push(ip);
        }
    }
    out
}

fn strip_xml_declaration(payload: &str) -> &str {
    let trimmed = payload.trim_start_matches('\u{feff}').trim_start();
    trimmed
        .strip_prefix("<?xml")
        .and_then(|rest| rest.split_once("?>"))
        .map_or(trimmed, |(_, body)| body)
}

/// Probe for print devices, sent once when the WSD listener starts.
pub fn wsd_probe(message_id: &str) -> Vec<u8> {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="utf-8"?>"#,
            r#"<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope" "#,
            r#"xmlns:wsa="http://schemas.xmlsoap.org/ws/2004/08/addressing" "#,
            r#"xmlns:wsd="http://schemas.xmlsoap.org/ws/2005/04/discovery" "#,
            r#"xmlns:wprt="http://schemas.microsoft.com/windows/2006/08/wdp/print">"#,
            r#"<soap:Header>"#,
            r#"<wsa:To>urn:schemas-xmlsoap-org:ws:2005:04:discovery</wsa:To>"#,
            r#"<wsa:Action>http://schemas.xmlsoap.org/ws/2005/04/discovery/Probe</wsa:Action>"#,
            r#"<wsa:MessageID>urn:uuid:{}</wsa:MessageID>"#,
            r#"</soap:Header>"#,
            r#"<soap:Body><wsd:Probe><wsd:Types>wprt:PrintDeviceType</wsd:Types></wsd:Probe></soap:Body>"#,
            r#"</soap:Envelope>"#
        ),
        message_id
    )
    .into_bytes()
}

fn url_ipv4(raw: &str) -> Option<Ipv4Addr> {
    let url = Url::parse(raw.trim()).ok()?;
    match url.host()? {
        url::Host::Ipv4(ip) => Some(ip),
        _ => None,
    }
}
