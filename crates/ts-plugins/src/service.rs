//! Service discovery: resolve a service to its PMT by feeding the PSI
//! stream through a section demux.

use tracing::{debug, info, warn};
use ts::psi::{TID_PAT, TID_PMT, TID_SDT_ACTUAL};
use ts::{Pat, Pid, PID_PAT, PID_SDT, Pmt, SectionDemux, Sdt, TsPacket};

/// The service to discover: by id, or by SDT name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceRef {
    Id(u16),
    Name(String),
}

/// Watches PAT/SDT/PMT until the target service's PMT is known, then keeps
/// tracking PMT versions.
pub struct ServiceDiscovery {
    target: ServiceRef,
    demux: SectionDemux,
    sections: Vec<(Pid, ts::Section)>,
    service_id: Option<u16>,
    pmt_pid: Option<Pid>,
    pmt_version: Option<u8>,
    nonexistent: bool,
}

impl ServiceDiscovery {
    pub fn new(target: ServiceRef) -> Self {
        let mut demux = SectionDemux::new();
        demux.add_pid(PID_PAT);
        if matches!(target, ServiceRef::Name(_)) {
            demux.add_pid(PID_SDT);
        }
        ServiceDiscovery {
            target,
            demux,
            sections: Vec::new(),
            service_id: None,
            pmt_pid: None,
            pmt_version: None,
            nonexistent: false,
        }
    }

    /// The resolved service id, once known.
    pub fn service_id(&self) -> Option<u16> {
        self.service_id
    }

    /// The PMT PID of the service, once known.
    pub fn pmt_pid(&self) -> Option<Pid> {
        self.pmt_pid
    }

    /// True when the TS definitely does not carry the target service.
    pub fn nonexistent(&self) -> bool {
        self.nonexistent
    }

    /// Feed one packet; returns a new or updated PMT when one completes.
    pub fn feed(&mut self, pkt: &TsPacket) -> Option<Pmt> {
        let mut sections = std::mem::take(&mut self.sections);
        self.demux.feed(pkt, &mut sections);
        let mut result = None;
        for (pid, section) in sections.drain(..) {
            if let Some(pmt) = self.handle_section(pid, &section) {
                result = Some(pmt);
            }
        }
        self.sections = sections;
        result
    }

    fn handle_section(&mut self, pid: Pid, section: &ts::Section) -> Option<Pmt> {
        match section.table_id() {
            TID_PAT if pid == PID_PAT => {
                let pat = Pat::parse(section).ok()?;
                self.handle_pat(&pat);
                None
            }
            TID_SDT_ACTUAL if pid == PID_SDT => {
                let sdt = Sdt::parse(section).ok()?;
                self.handle_sdt(&sdt);
                None
            }
            TID_PMT if Some(pid) == self.pmt_pid => {
                let pmt = Pmt::parse(section).ok()?;
                if Some(pmt.service_id) != self.service_id {
                    return None;
                }
                if self.pmt_version == Some(pmt.version) {
                    return None;
                }
                info!(
                    service_id = pmt.service_id,
                    version = pmt.version,
                    "PMT received"
                );
                self.pmt_version = Some(pmt.version);
                Some(pmt)
            }
            _ => None,
        }
    }

    fn handle_pat(&mut self, pat: &Pat) {
        let service_id = match (&self.target, self.service_id) {
            (_, Some(id)) => id,
            (ServiceRef::Id(id), None) => {
                self.service_id = Some(*id);
                *id
            }
            // Waiting for the SDT to resolve the name
            (ServiceRef::Name(_), None) => return,
        };
        match pat.pmt_pid(service_id) {
            Some(pmt_pid) => {
                if self.pmt_pid != Some(pmt_pid) {
                    debug!(service_id, pmt_pid, "service located in PAT");
                    if let Some(old) = self.pmt_pid {
                        self.demux.remove_pid(old);
                    }
                    self.demux.add_pid(pmt_pid);
                    self.pmt_pid = Some(pmt_pid);
                    self.pmt_version = None;
                }
            }
            None => {
                warn!(service_id, "service not present in PAT");
                self.nonexistent = true;
            }
        }
    }

    fn handle_sdt(&mut self, sdt: &Sdt) {
        let ServiceRef::Name(name) = &self.target else {
            return;
        };
        if self.service_id.is_some() {
            return;
        }
        match sdt.service_by_name(name) {
            Some(id) => {
                debug!(service = name.as_str(), service_id = id, "service resolved by name");
                self.service_id = Some(id);
            }
            None => {
                warn!(service = name.as_str(), "service name not found in SDT");
                self.nonexistent = true;
            }
        }
    }
}
