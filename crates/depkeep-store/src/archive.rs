use crate::StoreError;
use std::io::Read;

/// One regular file inside a bundle archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMember {
    pub path: String,
    pub data: Vec<u8>,
}

impl ArchiveMember {
    pub fn new(path: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            data,
        }
    }
}

/// Pack members into a tar archive.
///
/// Determinism guarantees:
/// - Members sorted lexicographically by path
/// - All timestamps set to 0 (Unix epoch)
/// - All ownership set to 0:0, mode 0644
///
/// Identical member sets therefore always produce identical bytes.
pub fn pack_archive(members: &[ArchiveMember]) -> Result<Vec<u8>, StoreError> {
    let mut sorted: Vec<&ArchiveMember> = members.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let mut ar = tar::Builder::new(Vec::new());
    for member in sorted {
        if member.path.is_empty() || member.path.starts_with('/') || member.path.contains("..") {
            return Err(StoreError::Archive(format!(
                "refusing unsafe member path '{}'",
                member.path
            )));
        }
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(0o644);
        header.set_size(member.data.len() as u64);
        header.set_cksum();
        ar.append_data(&mut header, &member.path, member.data.as_slice())?;
    }

    let data = ar.into_inner()?;
    Ok(data)
}

/// Read every regular file out of a tar archive, in archive order.
pub fn unpack_archive(tar_data: &[u8]) -> Result<Vec<ArchiveMember>, StoreError> {
    let mut ar = tar::Archive::new(tar_data);
    let mut members = Vec::new();
    for entry in ar.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let path = entry.path()?.to_string_lossy().into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        members.push(ArchiveMember { path, data });
    }
    Ok(members)
}
