use gimli::{BaseAddresses, CieOrFde, UnwindOffset, UnwindSection};

use crate::arcdata::ArcDataReader;

/// A binary search table for the FDEs of a section that has no
/// `.eh_frame_hdr` search table, such as `.debug_frame` or a bare
/// `.eh_frame`. It is built by one linear pass over the section.
pub struct DwarfCfiIndex {
    /// `(pc_start, pc_end, fde_offset)`, sorted by `pc_start`.
    entries: Vec<(u64, u64, usize)>,
}

impl DwarfCfiIndex {
    pub fn try_new<US>(unwind_section: &US, bases: &BaseAddresses) -> Result<Self, gimli::Error>
    where
        US: UnwindSection<ArcDataReader>,
    {
        let mut entries = Vec::new();

        let mut cur_cie = None;
        let mut entries_iter = unwind_section.entries(bases);
        while let Some(entry) = entries_iter.next()? {
            let fde = match entry {
                CieOrFde::Cie(cie) => {
                    cur_cie = Some(cie);
                    continue;
                }
                CieOrFde::Fde(partial_fde) => {
                    partial_fde.parse(|unwind_section, bases, cie_offset| {
                        if let Some(cie) = &cur_cie {
                            if cie.offset()
                                == <US::Offset as UnwindOffset<usize>>::into(cie_offset)
                            {
                                return Ok(cie.clone());
                            }
                        }
                        let cie = unwind_section.cie_from_offset(bases, cie_offset);
                        if let Ok(cie) = &cie {
                            cur_cie = Some(cie.clone());
                        }
                        cie
                    })?
                }
            };
            let start = fde.initial_address();
            let end = start.wrapping_add(fde.len());
            if end > start {
                entries.push((start, end, fde.offset()));
            }
        }
        entries.sort_by_key(|(start, _, _)| *start);
        Ok(Self { entries })
    }

    /// The offset of the FDE whose range contains `pc`.
    pub fn fde_offset_for_address(&self, pc: u64) -> Option<usize> {
        let i = match self.entries.binary_search_by_key(&pc, |(start, _, _)| *start) {
            Err(0) => return None,
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let (_, end, offset) = self.entries[i];
        (pc < end).then_some(offset)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
