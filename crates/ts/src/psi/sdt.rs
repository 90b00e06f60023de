use crate::descriptor::{DescriptorIterator, TAG_SERVICE};
use crate::psi::TID_SDT_ACTUAL;
use crate::psi::section::Section;
use crate::{Result, TsError};

/// One service entry in the SDT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdtService {
    pub service_id: u16,
    pub name: String,
}

/// Service Description Table (actual transport stream).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sdt {
    pub ts_id: u16,
    pub version: u8,
    pub services: Vec<SdtService>,
}

impl Sdt {
    /// Parse an SDT-actual from a validated section.
    pub fn parse(section: &Section) -> Result<Self> {
        if section.table_id() != TID_SDT_ACTUAL {
            return Err(TsError::UnexpectedTableId {
                expected: TID_SDT_ACTUAL,
                actual: section.table_id(),
            });
        }
        let body = section.body();
        if body.len() < 3 {
            return Err(TsError::SectionTooShort(body.len()));
        }
        // original_network_id (2 bytes) + reserved (1 byte)
        let mut services = Vec::new();
        let mut offset = 3;
        while offset + 5 <= body.len() {
            let service_id = u16::from_be_bytes([body[offset], body[offset + 1]]);
            let loop_len =
                (u16::from_be_bytes([body[offset + 3], body[offset + 4]]) & 0x0FFF) as usize;
            offset += 5;
            if offset + loop_len > body.len() {
                return Err(TsError::DescriptorOverrun);
            }
            let mut name = String::new();
            for desc in DescriptorIterator::new(body.slice(offset..offset + loop_len)) {
                if desc.tag == TAG_SERVICE && desc.data.len() >= 2 {
                    // service_type, provider name, service name
                    let provider_len = desc.data[1] as usize;
                    let name_pos = 2 + provider_len;
                    if name_pos < desc.data.len() {
                        let name_len = desc.data[name_pos] as usize;
                        let start = name_pos + 1;
                        if start + name_len <= desc.data.len() {
                            name = desc.data[start..start + name_len]
                                .iter()
                                .map(|&b| b as char)
                                .collect();
                        }
                    }
                }
            }
            services.push(SdtService { service_id, name });
            offset += loop_len;
        }
        Ok(Sdt {
            ts_id: section.table_id_extension(),
            version: section.version(),
            services,
        })
    }

    /// Look up a service by name, case-insensitive and blank-insensitive.
    pub fn service_by_name(&self, name: &str) -> Option<u16> {
        let wanted = normalize(name);
        self.services
            .iter()
            .find(|s| normalize(&s.name) == wanted)
            .map(|s| s.service_id)
    }
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal SDT section by hand.
    fn sdt_section(entries: &[(u16, &str)]) -> Section {
        let mut body = vec![0x00, 0x01, 0xFF]; // original_network_id + reserved
        for (service_id, name) in entries {
            let provider = b"prov";
            let mut desc = vec![0x01, provider.len() as u8];
            desc.extend_from_slice(provider);
            desc.push(name.len() as u8);
            desc.extend_from_slice(name.as_bytes());

            body.extend_from_slice(&service_id.to_be_bytes());
            body.push(0xFC);
            let loop_len = desc.len() as u16 + 2;
            body.extend_from_slice(&(0x8000 | loop_len).to_be_bytes());
            body.push(TAG_SERVICE);
            body.push(desc.len() as u8);
            body.extend_from_slice(&desc);
        }
        Section::build(TID_SDT_ACTUAL, 0x0042, 1, 0, 0, &body).unwrap()
    }

    #[test]
    fn test_parse_names() {
        let sdt = Sdt::parse(&sdt_section(&[(1, "News 24"), (2, "Movies")])).unwrap();
        assert_eq!(sdt.services.len(), 2);
        assert_eq!(sdt.services[0].name, "News 24");
        assert_eq!(sdt.service_by_name("news24"), Some(1));
        assert_eq!(sdt.service_by_name("MOVIES"), Some(2));
        assert_eq!(sdt.service_by_name("sports"), None);
    }
}
