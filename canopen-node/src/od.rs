//! The Object Dictionary (C1): a typed key/value store built once from an EDS at startup.
//!
//! Entries are keyed by (index, subindex); a flat name index is built alongside it so callers can
//! also look an entry up by its EDS `ParameterName`, the way the original firmware indexes `od["UNSIGNED8
//! value"]`. All access goes through a single [`tokio::sync::RwLock`]: reads may run concurrently,
//! writes serialize, and write-callbacks (PDO reconfiguration, heartbeat table updates) run
//! synchronously under the write lock so nothing ever observes a half-applied write.

use std::collections::HashMap;
use std::sync::Arc;

use canopen_common::object_ids;
use canopen_common::objects::{AccessType, DataType};
use canopen_common::sdo::AbortCode;
use canopen_eds::{ElectronicDataSheet, Object};
use tokio::sync::RwLock;

/// A callback run synchronously, under the OD write lock, after a successful write.
pub type WriteCallback = Box<dyn Fn(&[u8]) + Send + Sync>;

struct Entry {
    name: String,
    data_type: DataType,
    access: AccessType,
    pdo_mappable: bool,
    data: Vec<u8>,
    /// The value this entry was built with from the EDS; restored by NMT reset commands (§4.5).
    default: Vec<u8>,
    callbacks: Vec<WriteCallback>,
}

struct Inner {
    entries: HashMap<(u16, u8), Entry>,
    names: HashMap<String, (u16, u8)>,
}

/// The live object dictionary.
pub struct ObjectDictionary {
    inner: RwLock<Inner>,
}

/// A snapshot of an entry's static attributes, returned by [`ObjectDictionary::describe`].
#[derive(Clone, Debug)]
pub struct EntryInfo {
    pub index: u16,
    pub subindex: u8,
    pub name: String,
    pub data_type: DataType,
    pub access: AccessType,
    pub pdo_mappable: bool,
}

fn parse_default(data_type: DataType, raw: &str) -> Vec<u8> {
    let raw = raw.trim();
    match data_type {
        DataType::VisibleString => raw.as_bytes().to_vec(),
        DataType::OctetString | DataType::Domain => {
            if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
                (0..hex.len())
                    .step_by(2)
                    .filter_map(|i| hex.get(i..i + 2))
                    .filter_map(|byte| u8::from_str_radix(byte, 16).ok())
                    .collect()
            } else {
                raw.as_bytes().to_vec()
            }
        }
        DataType::Real32 => raw
            .parse::<f32>()
            .unwrap_or_default()
            .to_le_bytes()
            .to_vec(),
        DataType::Real64 => raw
            .parse::<f64>()
            .unwrap_or_default()
            .to_le_bytes()
            .to_vec(),
        _ => {
            let size = data_type.fixed_size().unwrap_or(4);
            let value: u64 = if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
                u64::from_str_radix(hex, 16).unwrap_or(0)
            } else {
                raw.parse::<i64>().map(|v| v as u64).unwrap_or(0)
            };
            let bytes = value.to_le_bytes();
            bytes[0..size].to_vec()
        }
    }
}

fn entry_name(object: &Object, sub: u8) -> String {
    if object.subs.len() <= 1 {
        object.parameter_name.clone()
    } else {
        format!("{} sub{sub}", object.parameter_name)
    }
}

fn insert_object(entries: &mut HashMap<(u16, u8), Entry>, names: &mut HashMap<String, (u16, u8)>, object: &Object) {
    let index = object.object_number as u16;
    for (&sub, sub_obj) in object.subs.iter() {
        let name = entry_name(object, sub);
        let data = parse_default(sub_obj.data_type, &sub_obj.default_value);
        names.entry(name.clone()).or_insert((index, sub));
        entries.insert(
            (index, sub),
            Entry {
                name,
                data_type: sub_obj.data_type,
                access: sub_obj.access_type,
                pdo_mappable: sub_obj.pdo_mapping,
                default: data.clone(),
                data,
                callbacks: Vec::new(),
            },
        );
    }
}

impl ObjectDictionary {
    /// Build the object dictionary from a parsed EDS.
    ///
    /// Standard identification entries (0x1000, 0x1008, 0x1009, 0x100A, 0x1018) are populated
    /// from the ordinary object list like everything else; where the device info section carries
    /// a more authoritative value (vendor name/number, product code) it overrides the generic
    /// default so the live OD matches the device that actually booted.
    pub fn from_eds(eds: &ElectronicDataSheet) -> Arc<Self> {
        let mut entries = HashMap::new();
        let mut names = HashMap::new();

        for object in eds
            .mandatory_objects
            .iter()
            .chain(eds.optional_objects.iter())
            .chain(eds.manufacturer_objects.iter())
        {
            insert_object(&mut entries, &mut names, object);
        }

        if let Some(e) = entries.get_mut(&(object_ids::DEVICE_NAME, 0)) {
            if !eds.device_info.product_name.is_empty() {
                e.data = eds.device_info.product_name.as_bytes().to_vec();
                e.default = e.data.clone();
            }
        }
        if let Some(vendor_id) = eds.device_info.vendor_number {
            if let Some(e) = entries.get_mut(&(object_ids::IDENTITY, 1)) {
                e.data = vendor_id.to_le_bytes().to_vec();
                e.default = e.data.clone();
            }
        }
        if let Some(product_code) = eds.device_info.product_number {
            if let Some(e) = entries.get_mut(&(object_ids::IDENTITY, 2)) {
                e.data = product_code.to_le_bytes().to_vec();
                e.default = e.data.clone();
            }
        }

        Arc::new(Self {
            inner: RwLock::new(Inner { entries, names }),
        })
    }

    /// Read the current raw bytes of an entry.
    pub async fn read(&self, index: u16, sub: u8) -> Result<Vec<u8>, AbortCode> {
        let inner = self.inner.read().await;
        let entry = entry_or_abort(&inner.entries, index, sub)?;
        if !entry.access.readable() {
            return Err(AbortCode::WriteOnly);
        }
        Ok(entry.data.clone())
    }

    /// Look an entry up by name and read it.
    pub async fn read_by_name(&self, name: &str) -> Result<Vec<u8>, AbortCode> {
        let inner = self.inner.read().await;
        let &(index, sub) = inner.names.get(name).ok_or(AbortCode::NoSuchObject)?;
        drop(inner);
        self.read(index, sub).await
    }

    /// Write raw bytes to an entry, validating access rules, fixed-width sizing, and the reserved
    /// semantics of 0x1005/0x1019, then run any write-callbacks under the same lock acquisition.
    pub async fn write(&self, index: u16, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        let mut inner = self.inner.write().await;

        validate_reserved(&inner, index, sub, data)?;

        let entry = entry_or_abort(&inner.entries, index, sub)?;
        if matches!(entry.access, AccessType::Const) {
            return Err(AbortCode::ReadOnly);
        }
        if !entry.access.writable() {
            return Err(AbortCode::ReadOnly);
        }
        if let Some(size) = entry.data_type.fixed_size() {
            if data.len() < size {
                return Err(AbortCode::DataTypeMismatchLengthLow);
            }
            if data.len() > size {
                return Err(AbortCode::DataTypeMismatchLengthHigh);
            }
        }

        let entry = inner.entries.get_mut(&(index, sub)).expect("checked above");
        entry.data = data.to_vec();
        let snapshot = entry.data.clone();
        for cb in &entry.callbacks {
            cb(&snapshot);
        }
        Ok(())
    }

    /// Write several entries as a single logical transaction: all writes are validated and applied
    /// under one acquisition of the write lock, so a reader can never observe some of them applied
    /// and others not. Used by the RPDO commit path, where a single frame maps to several OD
    /// entries that must update atomically together.
    pub async fn write_many(&self, writes: &[(u16, u8, Vec<u8>)]) -> Result<(), AbortCode> {
        let mut inner = self.inner.write().await;

        for (index, sub, data) in writes {
            validate_reserved(&inner, *index, *sub, data)?;
            let entry = entry_or_abort(&inner.entries, *index, *sub)?;
            if matches!(entry.access, AccessType::Const) || !entry.access.writable() {
                return Err(AbortCode::ReadOnly);
            }
            if let Some(size) = entry.data_type.fixed_size() {
                if data.len() < size {
                    return Err(AbortCode::DataTypeMismatchLengthLow);
                }
                if data.len() > size {
                    return Err(AbortCode::DataTypeMismatchLengthHigh);
                }
            }
        }

        for (index, sub, data) in writes {
            let entry = inner.entries.get_mut(&(*index, *sub)).expect("checked above");
            entry.data = data.clone();
            let snapshot = entry.data.clone();
            for cb in &entry.callbacks {
                cb(&snapshot);
            }
        }
        Ok(())
    }

    /// Look an entry up by name and write it.
    pub async fn write_by_name(&self, name: &str, data: &[u8]) -> Result<(), AbortCode> {
        let key = {
            let inner = self.inner.read().await;
            *inner.names.get(name).ok_or(AbortCode::NoSuchObject)?
        };
        self.write(key.0, key.1, data).await
    }

    /// Register a callback to run, synchronously and under the write lock, after every successful
    /// write to this entry.
    pub async fn subscribe_write<F>(&self, index: u16, sub: u8, callback: F) -> Result<(), AbortCode>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .get_mut(&(index, sub))
            .ok_or(AbortCode::NoSuchObject)?;
        entry.callbacks.push(Box::new(callback));
        Ok(())
    }

    /// Check whether an entry exists at all, without regard to access rules.
    pub async fn contains(&self, index: u16, sub: u8) -> bool {
        self.inner.read().await.entries.contains_key(&(index, sub))
    }

    /// Static attributes of an entry, for components (PDO mapping validation) that need the type
    /// and access rule without reading the current value.
    pub async fn describe(&self, index: u16, sub: u8) -> Result<EntryInfo, AbortCode> {
        let inner = self.inner.read().await;
        let entry = entry_or_abort(&inner.entries, index, sub)?;
        Ok(EntryInfo {
            index,
            subindex: sub,
            name: entry.name.clone(),
            data_type: entry.data_type,
            access: entry.access,
            pdo_mappable: entry.pdo_mappable,
        })
    }

    /// Restore every entry in `0x1000..=0x1FFF` (communication area) to its EDS default, for the
    /// NMT `ResetComm` command. Does not run write-callbacks: the caller (the NMT coordinator) is
    /// responsible for explicitly reloading dependent components (PDO engine mapping cache) once
    /// the reset completes, rather than replaying every callback mid-reset.
    pub async fn reset_communication(&self) {
        self.reset_range(0x1000..=0x1FFF).await;
    }

    /// Restore every entry in the dictionary to its EDS default, for the NMT `ResetApp` command.
    pub async fn reset_application(&self) {
        self.reset_range(0x0000..=0xFFFF).await;
    }

    async fn reset_range(&self, range: std::ops::RangeInclusive<u16>) {
        let mut inner = self.inner.write().await;
        for (&(index, _), entry) in inner.entries.iter_mut() {
            if range.contains(&index) {
                entry.data = entry.default.clone();
            }
        }
    }
}

fn entry_or_abort(
    entries: &HashMap<(u16, u8), Entry>,
    index: u16,
    sub: u8,
) -> Result<&Entry, AbortCode> {
    match entries.get(&(index, sub)) {
        Some(entry) => Ok(entry),
        None => {
            if entries.keys().any(|&(i, _)| i == index) {
                Err(AbortCode::NoSuchSubIndex)
            } else {
                Err(AbortCode::NoSuchObject)
            }
        }
    }
}

/// Reserved-index semantics that need cross-entry visibility (0x1005, 0x1019) or cannot be
/// expressed purely as a fixed-size/access-rule check.
fn validate_reserved(inner: &Inner, index: u16, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
    if index == object_ids::COB_ID_SYNC && sub == 0 {
        if data.len() != 4 {
            return Err(if data.len() < 4 {
                AbortCode::DataTypeMismatchLengthLow
            } else {
                AbortCode::DataTypeMismatchLengthHigh
            });
        }
        let raw = u32::from_le_bytes(data.try_into().unwrap());
        let id_bits = raw & !0xC000_0000;
        if id_bits > 0x7FF {
            return Err(AbortCode::ValueTooHigh);
        }
    }

    let is_mapping_object = (object_ids::RPDO_MAPPING_BASE..object_ids::RPDO_MAPPING_BASE + object_ids::NUM_PDOS * 0x100).contains(&index)
        || (object_ids::TPDO_MAPPING_BASE..object_ids::TPDO_MAPPING_BASE + object_ids::NUM_PDOS * 0x100).contains(&index);
    if is_mapping_object && sub > 0 {
        if data.len() != 4 {
            return Err(if data.len() < 4 {
                AbortCode::DataTypeMismatchLengthLow
            } else {
                AbortCode::DataTypeMismatchLengthHigh
            });
        }
        let raw = u32::from_le_bytes(data.try_into().unwrap());
        let mapped_index = (raw >> 16) as u16;
        let mapped_sub = ((raw >> 8) & 0xFF) as u8;
        let bit_len = (raw & 0xFF) as u8;

        if mapped_index != 0 && !inner.entries.get(&(mapped_index, mapped_sub)).map(|e| e.pdo_mappable).unwrap_or(false) {
            return Err(AbortCode::UnnallowedPdo);
        }

        let active_count = inner
            .entries
            .get(&(index, 0))
            .and_then(|e| e.data.first().copied())
            .unwrap_or(0);
        let mut total_bits: u32 = 0;
        for other_sub in 1..=active_count {
            let entry_bits = if other_sub == sub {
                bit_len as u32
            } else {
                inner
                    .entries
                    .get(&(index, other_sub))
                    .and_then(|e| e.data.as_slice().try_into().ok())
                    .map(|b: [u8; 4]| u32::from_le_bytes(b) & 0xFF)
                    .unwrap_or(0)
            };
            total_bits += entry_bits;
        }
        if total_bits > 64 {
            return Err(AbortCode::DataTypeMismatch);
        }
    }

    if index == object_ids::SYNC_COUNTER_OVERFLOW && sub == 0 {
        let cycle_period = inner
            .entries
            .get(&(object_ids::COMMUNICATION_CYCLE_PERIOD, 0))
            .and_then(|e| e.data.get(0..4))
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
            .unwrap_or(0);
        if cycle_period != 0 {
            return Err(AbortCode::CantStoreDeviceState);
        }
        let value = *data.first().unwrap_or(&0);
        if !(value == 0 || (2..=240).contains(&value)) {
            return Err(AbortCode::ValueTooHigh);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_EDS: &str = "\
[FileInfo]
FileName=test.eds
FileVersion=1
FileRevision=0
EDSVersion=4.0
Description=test fixture
CreationTime=10:00AM
CreationDate=01-01-2026
CreatedBy=test
ModificationTime=10:00AM
ModificationDate=01-01-2026
ModifiedBy=test

[DeviceInfo]
VendorName=Test Vendor
VendorNumber=0x1
ProductName=Test Node
ProductNumber=0x1
RevisionNumber=1
BaudRate_10=0
BaudRate_20=0
BaudRate_50=0
BaudRate_125=1
BaudRate_250=1
BaudRate_500=1
BaudRate_800=0
BaudRate_1000=1
SimpleBootUpMaster=0
SimpleBootUpSlave=1
Granularity=8
NrOfRXPDO=4
NrOfTXPDO=4
LSS_Supported=0

[MandatoryObjects]
SupportedObjects=5
1=0x1000
2=0x1006
3=0x1018
4=0x1019
5=0x1001

[1000]
ParameterName=Device type
ObjectType=0x7
DataType=0x7
AccessType=ro
DefaultValue=0x00000000
PDOMapping=0

[1001]
ParameterName=Error register
ObjectType=0x7
DataType=0x5
AccessType=ro
DefaultValue=0x00
PDOMapping=0

[1006]
ParameterName=Communication cycle period
ObjectType=0x7
DataType=0x7
AccessType=rw
DefaultValue=0
PDOMapping=0

[1018]
ParameterName=Identity object
ObjectType=0x9
SubNumber=4

[1018sub0]
ParameterName=Number of entries
DataType=0x5
AccessType=ro
DefaultValue=4
PDOMapping=0

[1018sub1]
ParameterName=Vendor ID
DataType=0x7
AccessType=ro
DefaultValue=0x99
PDOMapping=0

[1018sub2]
ParameterName=Product code
DataType=0x7
AccessType=ro
DefaultValue=0x00000001
PDOMapping=0

[1018sub3]
ParameterName=Revision number
DataType=0x7
AccessType=ro
DefaultValue=0x00000001
PDOMapping=0

[1018sub4]
ParameterName=Serial number
DataType=0x7
AccessType=ro
DefaultValue=0x00000000
PDOMapping=0

[1019]
ParameterName=Sync counter overflow
ObjectType=0x7
DataType=0x5
AccessType=rw
DefaultValue=0
PDOMapping=0

[OptionalObjects]
SupportedObjects=1
1=0x2001

[2001]
ParameterName=Custom byte
ObjectType=0x7
DataType=0x5
AccessType=rw
DefaultValue=0x00
PDOMapping=1

[ManufacturerObjects]
SupportedObjects=0
";

    fn test_eds() -> ElectronicDataSheet {
        canopen_eds::ElectronicDataSheet::from_str(TEST_EDS).unwrap()
    }

    #[tokio::test]
    async fn read_write_round_trip() {
        let od = ObjectDictionary::from_eds(&test_eds());
        od.write(0x2001, 0, &[0xFD]).await.unwrap();
        assert_eq!(od.read(0x2001, 0).await.unwrap(), vec![0xFD]);
    }

    #[tokio::test]
    async fn write_wrong_size_aborts() {
        let od = ObjectDictionary::from_eds(&test_eds());
        let err = od.write(0x2001, 0, &[1, 2]).await.unwrap_err();
        assert_eq!(err, AbortCode::DataTypeMismatchLengthHigh);
    }

    #[tokio::test]
    async fn write_read_only_aborts() {
        let od = ObjectDictionary::from_eds(&test_eds());
        let err = od.write(0x1000, 0, &[1, 2, 3, 4]).await.unwrap_err();
        assert_eq!(err, AbortCode::ReadOnly);
    }

    #[tokio::test]
    async fn missing_object_aborts() {
        let od = ObjectDictionary::from_eds(&test_eds());
        let err = od.read(0x3333, 0).await.unwrap_err();
        assert_eq!(err, AbortCode::NoSuchObject);
    }

    #[tokio::test]
    async fn missing_subindex_aborts() {
        let od = ObjectDictionary::from_eds(&test_eds());
        let err = od.read(0x1018, 0xEE).await.unwrap_err();
        assert_eq!(err, AbortCode::NoSuchSubIndex);
    }

    #[tokio::test]
    async fn write_callback_runs_under_lock() {
        let od = ObjectDictionary::from_eds(&test_eds());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        od.subscribe_write(0x2001, 0, move |data| {
            seen2.lock().unwrap().push(data.to_vec());
        })
        .await
        .unwrap();

        od.write(0x2001, 0, &[1]).await.unwrap();
        od.write(0x2001, 0, &[1]).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![vec![1], vec![1]]);
    }

    #[tokio::test]
    async fn name_lookup() {
        let od = ObjectDictionary::from_eds(&test_eds());
        assert_eq!(
            od.read_by_name("Custom byte").await.unwrap(),
            od.read(0x2001, 0).await.unwrap()
        );
    }

    #[tokio::test]
    async fn sync_counter_overflow_requires_zero_cycle_period() {
        let od = ObjectDictionary::from_eds(&test_eds());
        // 0x1006 defaults to 0, so a legal overflow value is accepted...
        od.write(object_ids::SYNC_COUNTER_OVERFLOW, 0, &[10])
            .await
            .unwrap();

        // ...but once the cycle period is nonzero the overflow value is frozen.
        od.write(object_ids::COMMUNICATION_CYCLE_PERIOD, 0, &10_000u32.to_le_bytes())
            .await
            .unwrap();
        let err = od
            .write(object_ids::SYNC_COUNTER_OVERFLOW, 0, &[20])
            .await
            .unwrap_err();
        assert_eq!(err, AbortCode::CantStoreDeviceState);
    }

    #[tokio::test]
    async fn write_many_applies_all_or_rejects_all() {
        let od = ObjectDictionary::from_eds(&test_eds());
        od.write_many(&[(0x2001, 0, vec![7]), (0x1006, 0, 1000u32.to_le_bytes().to_vec())])
            .await
            .unwrap();
        assert_eq!(od.read(0x2001, 0).await.unwrap(), vec![7]);
        assert_eq!(od.read(0x1006, 0).await.unwrap(), 1000u32.to_le_bytes().to_vec());

        // second entry is read-only, so neither write should apply
        let err = od
            .write_many(&[(0x2001, 0, vec![9]), (0x1000, 0, vec![1, 2, 3, 4])])
            .await
            .unwrap_err();
        assert_eq!(err, AbortCode::ReadOnly);
        assert_eq!(od.read(0x2001, 0).await.unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn reset_communication_restores_defaults_but_not_application_objects() {
        let od = ObjectDictionary::from_eds(&test_eds());
        od.write(0x2001, 0, &[7]).await.unwrap();
        od.write(object_ids::COMMUNICATION_CYCLE_PERIOD, 0, &10_000u32.to_le_bytes())
            .await
            .unwrap();

        od.reset_communication().await;

        assert_eq!(od.read(0x1006, 0).await.unwrap(), 0u32.to_le_bytes());
        // 0x2001 is outside the communication range and must survive a ResetComm.
        assert_eq!(od.read(0x2001, 0).await.unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn reset_application_restores_everything() {
        let od = ObjectDictionary::from_eds(&test_eds());
        od.write(0x2001, 0, &[7]).await.unwrap();

        od.reset_application().await;

        assert_eq!(od.read(0x2001, 0).await.unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn sync_counter_overflow_rejects_illegal_value() {
        let od = ObjectDictionary::from_eds(&test_eds());
        let err = od
            .write(object_ids::SYNC_COUNTER_OVERFLOW, 0, &[1])
            .await
            .unwrap_err();
        assert_eq!(err, AbortCode::ValueTooHigh);
    }
}
