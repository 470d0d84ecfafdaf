//! Minimal ISO-9660 image writer with a Joliet supplementary volume.
//!
//! Only what a NoCloud seed needs: a single root directory holding a handful
//! of small files. Each file is listed twice, once under an 8.3 style primary
//! name and once under its real name in the Joliet tree; both records point
//! at the same data extent.
//!
//! Sector layout:
//!
//! | sector | contents                          |
//! |--------|-----------------------------------|
//! | 0-15   | system area (zero)                |
//! | 16     | primary volume descriptor         |
//! | 17     | Joliet supplementary descriptor   |
//! | 18     | descriptor set terminator         |
//! | 19-22  | L/M path tables, primary + Joliet |
//! | 23     | primary root directory            |
//! | 24     | Joliet root directory             |
//! | 25-    | file data                         |

use chrono::{DateTime, Datelike, Timelike, Utc};
use tracing::debug;

use crate::error::{Error, Result};

pub(crate) const SECTOR_SIZE: usize = 2048;

const PVD_SECTOR: usize = 16;
const SVD_SECTOR: usize = 17;
const TERMINATOR_SECTOR: usize = 18;
const PATH_TABLE_SECTORS: [usize; 4] = [19, 20, 21, 22];
const PRIMARY_ROOT_SECTOR: usize = 23;
const JOLIET_ROOT_SECTOR: usize = 24;
const FIRST_DATA_SECTOR: usize = 25;

/// UCS-2 level 3
const JOLIET_ESCAPE: &[u8] = b"%/E";
const STANDARD_ID: &[u8] = b"CD001";
/// One path table entry for the root: 8 byte header, 1 byte name, 1 pad.
const PATH_TABLE_SIZE: u32 = 10;
const DIR_FLAG: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq)]
struct IsoFile {
    /// `NAME.EXT;1` in d-characters
    primary_name: String,
    joliet_name: String,
    data: Vec<u8>,
}

/// Collects files and writes them out as an ISO image.
#[derive(Debug, Clone)]
pub(crate) struct IsoBuilder {
    volume_id: String,
    files: Vec<IsoFile>,
    timestamp: DateTime<Utc>,
}

fn is_d_char(c: char) -> bool {
    c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_'
}

fn check_primary_name(name: &str) -> Result<()> {
    let bad = || Error::validation(format!("invalid ISO-9660 file name '{name}'"));
    let (stem, version) = name.split_once(';').ok_or_else(bad)?;
    let (base, ext) = stem.split_once('.').ok_or_else(bad)?;
    let valid = !base.is_empty()
        && base.len() <= 8
        && ext.len() <= 3
        && base.chars().chain(ext.chars()).all(is_d_char)
        && version == "1";
    if valid {
        Ok(())
    } else {
        Err(bad())
    }
}

impl IsoBuilder {
    pub(crate) fn new(volume_id: impl Into<String>) -> Self {
        Self {
            volume_id: volume_id.into(),
            files: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Use a fixed timestamp for every date field.
    #[cfg(test)]
    pub(crate) fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub(crate) fn add_file(
        &mut self,
        primary_name: &str,
        joliet_name: &str,
        data: impl Into<Vec<u8>>,
    ) -> Result<()> {
        check_primary_name(primary_name)?;
        // Joliet allows at most 64 UCS-2 characters
        if joliet_name.is_empty()
            || joliet_name.encode_utf16().count() > 64
            || joliet_name.contains(['/', '\\', ':', ';', '*', '?'])
        {
            return Err(Error::validation(format!(
                "invalid Joliet file name '{joliet_name}'"
            )));
        }
        if self
            .files
            .iter()
            .any(|f| f.primary_name == primary_name || f.joliet_name == joliet_name)
        {
            return Err(Error::validation(format!(
                "duplicate file {joliet_name} in ISO image"
            )));
        }
        self.files.push(IsoFile {
            primary_name: primary_name.to_owned(),
            joliet_name: joliet_name.to_owned(),
            data: data.into(),
        });
        Ok(())
    }

    pub(crate) fn build(&self) -> Result<Vec<u8>> {
        // Assign data extents in insertion order; empty files own no
        // sectors and are recorded at extent 0
        let mut next = FIRST_DATA_SECTOR;
        let mut extents = Vec::with_capacity(self.files.len());
        for file in &self.files {
            if file.data.is_empty() {
                extents.push(0);
            } else {
                extents.push(next);
                next += file.data.len().div_ceil(SECTOR_SIZE);
            }
        }
        let total_sectors = next;

        let mut image = vec![0u8; total_sectors * SECTOR_SIZE];

        let primary = self.directory(&extents, false)?;
        let joliet = self.directory(&extents, true)?;
        sector_mut(&mut image, PRIMARY_ROOT_SECTOR)[..primary.len()].copy_from_slice(&primary);
        sector_mut(&mut image, JOLIET_ROOT_SECTOR)[..joliet.len()].copy_from_slice(&joliet);

        let [pl, pm, jl, jm] = PATH_TABLE_SECTORS;
        write_path_table(sector_mut(&mut image, pl), PRIMARY_ROOT_SECTOR, false);
        write_path_table(sector_mut(&mut image, pm), PRIMARY_ROOT_SECTOR, true);
        write_path_table(sector_mut(&mut image, jl), JOLIET_ROOT_SECTOR, false);
        write_path_table(sector_mut(&mut image, jm), JOLIET_ROOT_SECTOR, true);

        self.write_descriptor(sector_mut(&mut image, PVD_SECTOR), total_sectors, false);
        self.write_descriptor(sector_mut(&mut image, SVD_SECTOR), total_sectors, true);
        let terminator = sector_mut(&mut image, TERMINATOR_SECTOR);
        terminator[0] = 255;
        terminator[1..6].copy_from_slice(STANDARD_ID);
        terminator[6] = 1;

        for (file, extent) in self.files.iter().zip(&extents) {
            if file.data.is_empty() {
                continue;
            }
            let start = extent * SECTOR_SIZE;
            image[start..start + file.data.len()].copy_from_slice(&file.data);
        }

        debug!(
            "Built ISO image {} with {} files, {} bytes",
            self.volume_id,
            self.files.len(),
            image.len()
        );
        Ok(image)
    }

    /// The root directory extent: `.`, `..`, then the files sorted by name.
    fn directory(&self, extents: &[usize], joliet: bool) -> Result<Vec<u8>> {
        let root = if joliet {
            JOLIET_ROOT_SECTOR
        } else {
            PRIMARY_ROOT_SECTOR
        };
        let mut out = Vec::new();
        self.push_record(&mut out, root, SECTOR_SIZE, DIR_FLAG, &[0]);
        self.push_record(&mut out, root, SECTOR_SIZE, DIR_FLAG, &[1]);

        let mut entries: Vec<(Vec<u8>, usize, usize)> = self
            .files
            .iter()
            .zip(extents)
            .map(|(f, &extent)| {
                let name = if joliet {
                    ucs2(&f.joliet_name)
                } else {
                    f.primary_name.as_bytes().to_vec()
                };
                (name, extent, f.data.len())
            })
            .collect();
        entries.sort();
        for (name, extent, len) in entries {
            self.push_record(&mut out, extent, len, 0, &name);
        }

        if out.len() > SECTOR_SIZE {
            return Err(Error::validation(
                "too many files for a single sector ISO directory",
            ));
        }
        Ok(out)
    }

    fn push_record(&self, out: &mut Vec<u8>, extent: usize, len: usize, flags: u8, name: &[u8]) {
        let pad = usize::from(name.len() % 2 == 0);
        let record_len = 33 + name.len() + pad;
        let mut rec = vec![0u8; record_len];
        rec[0] = record_len as u8;
        put_both_u32(&mut rec[2..10], extent as u32);
        put_both_u32(&mut rec[10..18], len as u32);
        rec[18..25].copy_from_slice(&record_date(&self.timestamp));
        rec[25] = flags;
        put_both_u16(&mut rec[28..32], 1);
        rec[32] = name.len() as u8;
        rec[33..33 + name.len()].copy_from_slice(name);
        out.extend_from_slice(&rec);
    }

    fn write_descriptor(&self, sector: &mut [u8], total_sectors: usize, joliet: bool) {
        sector[0] = if joliet { 2 } else { 1 };
        sector[1..6].copy_from_slice(STANDARD_ID);
        sector[6] = 1;

        let text = |field: &mut [u8], value: &str| {
            if joliet {
                fill_ucs2(field, value)
            } else {
                fill_ascii(field, value)
            }
        };
        text(&mut sector[8..40], "");
        text(&mut sector[40..72], &self.volume_id);
        put_both_u32(&mut sector[80..88], total_sectors as u32);
        if joliet {
            sector[88..88 + JOLIET_ESCAPE.len()].copy_from_slice(JOLIET_ESCAPE);
        }
        put_both_u16(&mut sector[120..124], 1);
        put_both_u16(&mut sector[124..128], 1);
        put_both_u16(&mut sector[128..132], SECTOR_SIZE as u16);
        put_both_u32(&mut sector[132..140], PATH_TABLE_SIZE);

        let [pl, pm, jl, jm] = PATH_TABLE_SECTORS;
        let (l_table, m_table, root) = if joliet {
            (jl, jm, JOLIET_ROOT_SECTOR)
        } else {
            (pl, pm, PRIMARY_ROOT_SECTOR)
        };
        sector[140..144].copy_from_slice(&(l_table as u32).to_le_bytes());
        sector[148..152].copy_from_slice(&(m_table as u32).to_be_bytes());

        let mut root_record = Vec::new();
        self.push_record(&mut root_record, root, SECTOR_SIZE, DIR_FLAG, &[0]);
        sector[156..190].copy_from_slice(&root_record);

        // volume set, publisher, preparer, application, then the three
        // 37 byte file identifiers
        for (start, end) in [(190, 318), (318, 446), (446, 574), (574, 702)] {
            text(&mut sector[start..end], "");
        }
        for (start, end) in [(702, 739), (739, 776), (776, 813)] {
            text(&mut sector[start..end], "");
        }

        let now = descriptor_date(Some(&self.timestamp));
        sector[813..830].copy_from_slice(&now);
        sector[830..847].copy_from_slice(&now);
        sector[847..864].copy_from_slice(&descriptor_date(None));
        sector[864..881].copy_from_slice(&now);
        sector[881] = 1;
    }
}

/// A path table holding only the root directory. The L table is
/// little-endian, the M table big-endian.
fn write_path_table(sector: &mut [u8], root_extent: usize, big_endian: bool) {
    let extent = root_extent as u32;
    // directory identifier length, extended attribute length
    sector[0] = 1;
    sector[1] = 0;
    if big_endian {
        sector[2..6].copy_from_slice(&extent.to_be_bytes());
        sector[6..8].copy_from_slice(&1u16.to_be_bytes());
    } else {
        sector[2..6].copy_from_slice(&extent.to_le_bytes());
        sector[6..8].copy_from_slice(&1u16.to_le_bytes());
    }
    // root identifier, then padding to an even length
    sector[8] = 0;
    sector[9] = 0;
}

fn sector_mut(image: &mut [u8], sector: usize) -> &mut [u8] {
    &mut image[sector * SECTOR_SIZE..(sector + 1) * SECTOR_SIZE]
}

fn put_both_u16(field: &mut [u8], v: u16) {
    field[..2].copy_from_slice(&v.to_le_bytes());
    field[2..4].copy_from_slice(&v.to_be_bytes());
}

fn put_both_u32(field: &mut [u8], v: u32) {
    field[..4].copy_from_slice(&v.to_le_bytes());
    field[4..8].copy_from_slice(&v.to_be_bytes());
}

fn fill_ascii(field: &mut [u8], value: &str) {
    field.fill(b' ');
    let bytes = value.as_bytes();
    let n = bytes.len().min(field.len());
    field[..n].copy_from_slice(&bytes[..n]);
}

fn fill_ucs2(field: &mut [u8], value: &str) {
    for pair in field.chunks_exact_mut(2) {
        pair.copy_from_slice(&[0, b' ']);
    }
    let encoded = ucs2(value);
    let n = encoded.len().min(field.len() & !1);
    field[..n].copy_from_slice(&encoded[..n]);
}

fn ucs2(value: &str) -> Vec<u8> {
    value.encode_utf16().flat_map(u16::to_be_bytes).collect()
}

/// Seven byte directory record date, UTC.
fn record_date(ts: &DateTime<Utc>) -> [u8; 7] {
    [
        (ts.year() - 1900).clamp(0, 255) as u8,
        ts.month() as u8,
        ts.day() as u8,
        ts.hour() as u8,
        ts.minute() as u8,
        ts.second() as u8,
        0,
    ]
}

/// Seventeen byte volume descriptor date; `None` is the "not specified"
/// value.
fn descriptor_date(ts: Option<&DateTime<Utc>>) -> [u8; 17] {
    let mut out = [b'0'; 17];
    out[16] = 0;
    if let Some(ts) = ts {
        let digits = format!(
            "{}{:02}",
            ts.format("%Y%m%d%H%M%S"),
            ts.timestamp_subsec_millis() / 10
        );
        out[..16].copy_from_slice(&digits.as_bytes()[..16]);
    }
    out
}


#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::reader::*;
    use super::*;

    fn fixed() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 12, 30, 45).unwrap()
    }

    #[test]
    fn test_descriptors() {
        let mut iso = IsoBuilder::new("cidata").with_timestamp(fixed());
        iso.add_file("README.;1", "readme", "hello").unwrap();
        let image = iso.build().unwrap();
        assert_eq!(image.len() % SECTOR_SIZE, 0);
        assert_eq!(image.len() / SECTOR_SIZE, FIRST_DATA_SECTOR + 1);

        let pvd = descriptor(&image, 1).unwrap();
        assert_eq!(&pvd[40..46], b"cidata");
        assert_eq!(u32_le(&pvd[80..84]), FIRST_DATA_SECTOR + 1);
        assert_eq!(&pvd[813..829], b"2024030912304500");

        let svd = descriptor(&image, 2).unwrap();
        assert_eq!(&svd[88..91], b"%/E");
        assert_eq!(decode_name(&svd[40..52], true), "cidata");

        assert_eq!(sector(&image, TERMINATOR_SECTOR)[0], 255);
    }

    #[test]
    fn test_files_in_both_trees() {
        let mut iso = IsoBuilder::new("test").with_timestamp(fixed());
        iso.add_file("USERDATA.;1", "user-data", "#cloud-config\n").unwrap();
        iso.add_file("METADATA.;1", "meta-data", "instance-id: x\n").unwrap();
        let big = vec![0xa5u8; 3 * SECTOR_SIZE + 7];
        iso.add_file("BIG.;1", "big-file", big.clone()).unwrap();
        iso.add_file("EMPTY.;1", "empty", Vec::new()).unwrap();
        let image = iso.build().unwrap();

        let joliet = root_files(&image, true);
        let names: Vec<_> = joliet.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["big-file", "empty", "meta-data", "user-data"]);
        assert_eq!(joliet[0].1, big);
        assert!(joliet[1].1.is_empty());
        assert_eq!(joliet[2].1, b"instance-id: x\n");

        let primary = root_files(&image, false);
        let names: Vec<_> = primary.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["BIG.;1", "EMPTY.;1", "METADATA.;1", "USERDATA.;1"]);
        assert_eq!(primary[3].1, b"#cloud-config\n");
    }

    #[test]
    fn test_path_tables() {
        let mut iso = IsoBuilder::new("cidata").with_timestamp(fixed());
        iso.add_file("USERDATA.;1", "user-data", "#cloud-config\n").unwrap();
        let image = iso.build().unwrap();

        for (kind, root_sector) in [(1, PRIMARY_ROOT_SECTOR), (2, JOLIET_ROOT_SECTOR)] {
            let desc = descriptor(&image, kind).unwrap();
            let root_extent = u32_le(&desc[158..162]);
            assert_eq!(root_extent, root_sector);
            assert_eq!(u32_le(&desc[132..136]), PATH_TABLE_SIZE as usize);

            let l_table = sector(&image, u32_le(&desc[140..144]));
            assert_eq!(&l_table[..2], &[1, 0]);
            assert_eq!(u32_le(&l_table[2..6]), root_extent);
            assert_eq!(u16::from_le_bytes([l_table[6], l_table[7]]), 1);
            assert_eq!(&l_table[8..10], &[0, 0]);

            let m_location = u32::from_be_bytes(desc[148..152].try_into().unwrap());
            let m_table = sector(&image, m_location as usize);
            assert_eq!(&m_table[..2], &[1, 0]);
            let m_extent = u32::from_be_bytes(m_table[2..6].try_into().unwrap());
            assert_eq!(m_extent as usize, root_extent);
            assert_eq!(u16::from_be_bytes([m_table[6], m_table[7]]), 1);
            assert_eq!(&m_table[8..10], &[0, 0]);

            // the root directory's own "." record agrees
            let dot = sector(&image, root_extent);
            assert_eq!(u32_le(&dot[2..6]), root_extent);
        }
        let tables: Vec<_> = PATH_TABLE_SECTORS
            .iter()
            .map(|&n| sector(&image, n)[0])
            .collect();
        assert_eq!(tables, [1, 1, 1, 1]);
    }

    #[test]
    fn test_empty_file_extent() {
        let mut iso = IsoBuilder::new("cidata").with_timestamp(fixed());
        iso.add_file("USERDATA.;1", "user-data", Vec::new()).unwrap();
        iso.add_file("METADATA.;1", "meta-data", "instance-id: x\n").unwrap();
        let image = iso.build().unwrap();
        // the empty file takes no sector, so the image ends after meta-data
        assert_eq!(image.len() / SECTOR_SIZE, FIRST_DATA_SECTOR + 1);

        let total = image.len() / SECTOR_SIZE;
        for root_sector in [PRIMARY_ROOT_SECTOR, JOLIET_ROOT_SECTOR] {
            let dir = sector(&image, root_sector);
            let mut off = 0;
            let mut extents = Vec::new();
            while dir[off] != 0 {
                let rec = &dir[off..off + dir[off] as usize];
                if rec[25] & DIR_FLAG == 0 {
                    extents.push((u32_le(&rec[2..6]), u32_le(&rec[10..14])));
                }
                off += rec.len();
            }
            // sorted by name: meta-data, then user-data
            assert_eq!(extents, [(FIRST_DATA_SECTOR, 15), (0, 0)]);
            assert!(extents.iter().all(|&(extent, _)| extent < total));
        }
        let joliet = root_files(&image, true);
        assert_eq!(joliet[1], ("user-data".to_owned(), Vec::new()));
    }

    #[test]
    fn test_invalid_names() {
        let mut iso = IsoBuilder::new("test");
        assert!(iso.add_file("lower.;1", "x", "").is_err());
        assert!(iso.add_file("TOOLONGNAME.;1", "x", "").is_err());
        assert!(iso.add_file("NOVERSION.", "x", "").is_err());
        assert!(iso.add_file("OK.;1", "a/b", "").is_err());
        iso.add_file("OK.;1", "ok", "").unwrap();
        assert!(iso.add_file("OK.;1", "other", "").is_err());
    }
}
