use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// 经代理看到的出口 IP 与地理信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitIpInfo {
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub asn: Option<String>,
}

/// ip-api.com 风格的响应；`ip` 字段兼容 ipify 一类接口
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupResponse {
    status: Option<String>,
    #[serde(alias = "ip")]
    query: Option<String>,
    country: Option<String>,
    country_code: Option<String>,
    region_name: Option<String>,
    city: Option<String>,
    isp: Option<String>,
    org: Option<String>,
    #[serde(rename = "as")]
    asn: Option<String>,
}

/// Parse a lookup body: JSON (`query`/`ip` plus optional geo fields) or a bare IP literal.
pub fn parse_exit_ip(body: &[u8]) -> Option<ExitIpInfo> {
    let text = std::str::from_utf8(body).ok()?.trim();
    if let Ok(ip) = text.parse::<IpAddr>() {
        return Some(ExitIpInfo {
            ip: ip.to_string(),
            country: None,
            country_code: None,
            region: None,
            city: None,
            isp: None,
            org: None,
            asn: None,
        });
    }

    let raw: LookupResponse = serde_json::from_str(text).ok()?;
    if raw.status.as_deref() == Some("fail") {
        return None;
    }
    let ip = raw.query?;
    ip.parse::<IpAddr>().ok()?;
    Some(ExitIpInfo {
        ip,
        country: raw.country,
        country_code: raw.country_code,
        region: raw.region_name,
        city: raw.city,
        isp: raw.isp,
        org: raw.org,
        asn: raw.asn,
    })
}
