use crate::pid::Pid;
use crate::psi::TID_PAT;
use crate::psi::section::Section;
use crate::{Result, TsError};

/// One program entry in the PAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatProgram {
    pub service_id: u16,
    pub pmt_pid: Pid,
}

/// Program Association Table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pat {
    pub ts_id: u16,
    pub version: u8,
    pub nit_pid: Option<Pid>,
    pub programs: Vec<PatProgram>,
}

impl Pat {
    /// Parse a PAT from a validated section.
    pub fn parse(section: &Section) -> Result<Self> {
        if section.table_id() != TID_PAT {
            return Err(TsError::UnexpectedTableId {
                expected: TID_PAT,
                actual: section.table_id(),
            });
        }
        let body = section.body();
        let mut nit_pid = None;
        let mut programs = Vec::with_capacity(body.len() / 4);
        for entry in body.chunks_exact(4) {
            let number = u16::from_be_bytes([entry[0], entry[1]]);
            let pid = u16::from_be_bytes([entry[2], entry[3]]) & 0x1FFF;
            if number == 0 {
                nit_pid = Some(pid);
            } else {
                programs.push(PatProgram {
                    service_id: number,
                    pmt_pid: pid,
                });
            }
        }
        Ok(Pat {
            ts_id: section.table_id_extension(),
            version: section.version(),
            nit_pid,
            programs,
        })
    }

    /// PMT PID of a service, if listed.
    pub fn pmt_pid(&self, service_id: u16) -> Option<Pid> {
        self.programs
            .iter()
            .find(|p| p.service_id == service_id)
            .map(|p| p.pmt_pid)
    }

    /// Serialize back into a section (used by tests and tools).
    pub fn to_section(&self) -> Result<Section> {
        let mut body = Vec::with_capacity(4 * (self.programs.len() + 1));
        if let Some(nit) = self.nit_pid {
            body.extend_from_slice(&0u16.to_be_bytes());
            body.extend_from_slice(&(0xE000 | nit).to_be_bytes());
        }
        for program in &self.programs {
            body.extend_from_slice(&program.service_id.to_be_bytes());
            body.extend_from_slice(&(0xE000 | program.pmt_pid).to_be_bytes());
        }
        Section::build(TID_PAT, self.ts_id, self.version, 0, 0, &body)
    }
}
