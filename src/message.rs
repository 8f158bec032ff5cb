//! Extraction of name → address data from DNS responses.

use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::RData;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use crate::error::FqdnError;
use crate::name_manager::DnsIpRecords;
use crate::selector::to_fqdn;

/// Longest CNAME chain followed from the question name.
const MAX_CNAME_DEPTH: usize = 16;

/// What a response says about names and addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseDetails {
    /// Normalized name of the first question.
    pub qname: String,
    /// Response code.
    pub rcode: ResponseCode,
    /// Addresses per owner name. The question name also receives the
    /// addresses reached through its CNAME chain.
    pub response_ips: BTreeMap<String, DnsIpRecords>,
}

impl ResponseDetails {
    /// Every address in the response, deduplicated.
    pub fn all_ips(&self) -> Vec<IpAddr> {
        let mut ips: Vec<IpAddr> = self
            .response_ips
            .values()
            .flat_map(|records| records.ips.iter().copied())
            .collect();
        ips.sort();
        ips.dedup();
        ips
    }
}

/// Pull A/AAAA answers out of `message`, grouped by owner name.
pub fn extract_response_ips(message: &Message) -> Result<ResponseDetails, FqdnError> {
    let query = message
        .queries()
        .first()
        .ok_or_else(|| FqdnError::MalformedMessage("response has no question".to_string()))?;
    let qname = to_fqdn(&query.name().to_ascii());

    let mut response_ips: BTreeMap<String, DnsIpRecords> = BTreeMap::new();
    let mut cnames: HashMap<String, (String, u32)> = HashMap::new();

    for record in message.answers() {
        let owner = to_fqdn(&record.name().to_ascii());
        let ip = match record.data() {
            RData::A(a) => IpAddr::V4(a.0),
            RData::AAAA(aaaa) => IpAddr::V6(aaaa.0),
            RData::CNAME(target) => {
                cnames.insert(owner, (to_fqdn(&target.0.to_ascii()), record.ttl()));
                continue;
            }
            _ => continue,
        };
        add_ip(&mut response_ips, owner, ip, record.ttl());
    }

    // Follow the chain from the question name and credit it with the
    // addresses found at every hop.
    let mut chained: Vec<(IpAddr, u32)> = Vec::new();
    let mut current = qname.clone();
    let mut chain_ttl = u32::MAX;
    for _ in 0..MAX_CNAME_DEPTH {
        let Some((target, ttl)) = cnames.get(&current) else {
            break;
        };
        chain_ttl = chain_ttl.min(*ttl);
        if let Some(records) = response_ips.get(target) {
            let ttl = chain_ttl.min(records.ttl);
            chained.extend(records.ips.iter().map(|ip| (*ip, ttl)));
        }
        if *target == qname {
            break;
        }
        current = target.clone();
    }
    for (ip, ttl) in chained {
        add_ip(&mut response_ips, qname.clone(), ip, ttl);
    }

    Ok(ResponseDetails {
        qname,
        rcode: message.response_code(),
        response_ips,
    })
}

fn add_ip(map: &mut BTreeMap<String, DnsIpRecords>, name: String, ip: IpAddr, ttl: u32) {
    let records = map.entry(name).or_insert_with(|| DnsIpRecords {
        ttl,
        ips: Vec::new(),
    });
    records.ttl = records.ttl.min(ttl);
    if !records.ips.contains(&ip) {
        records.ips.push(ip);
    }
}
