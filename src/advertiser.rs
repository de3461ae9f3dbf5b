//! Programming the local controller with the cloned advertisement.
//!
//! The advertiser owns the advertisement and scan-response records, lays
//! them out under the 31 octet PDU limit, and programs the controller
//! through [`MgmtClient`]. Once registered, the records are frozen:
//! reconfiguration requires `unregister`, mutate, `register`.

use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::adv::{
    codec, AdValue, AdvRecord, AD_FLAGS, AD_MANUFACTURER, AD_NAME_COMPLETE, AD_NAME_SHORT,
    AD_SERVICE_DATA16, AD_TX_POWER, AD_UUIDS128_COMPLETE, AD_UUIDS128_INCOMPLETE,
    AD_UUIDS16_COMPLETE, AD_UUIDS16_INCOMPLETE, MAX_AD_LEN,
};
use crate::api::BDAddr;
use crate::mgmt::MgmtClient;
use crate::{Error, Result};

/// The advertising instance programmed via the management interface.
/// Instance 1 collides with the stack's own default advertisement.
const ADV_INSTANCE: u8 = 2;

/// Field layout priority inside the advertisement PDU. Whole fields that
/// do not fit overflow into the scan response in the same order; unknown
/// AD types come last, in record order.
const PRIORITY: [u8; 10] = [
    AD_FLAGS,
    AD_NAME_SHORT,
    AD_NAME_COMPLETE,
    AD_UUIDS16_COMPLETE,
    AD_UUIDS16_INCOMPLETE,
    AD_UUIDS128_COMPLETE,
    AD_UUIDS128_INCOMPLETE,
    AD_TX_POWER,
    AD_SERVICE_DATA16,
    AD_MANUFACTURER,
];

pub struct Advertiser {
    adapter: bluer::Adapter,
    mgmt: MgmtClient,
    advertisement: AdvRecord,
    scan_response: AdvRecord,
    pinned_address: Option<BDAddr>,
    registered: bool,
}

impl Advertiser {
    pub fn new(adapter: bluer::Adapter, mgmt: MgmtClient) -> Self {
        Advertiser {
            adapter,
            mgmt,
            advertisement: AdvRecord::new(),
            scan_response: AdvRecord::new(),
            pinned_address: None,
            registered: false,
        }
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.registered {
            return Err(Error::Configuration(
                "advertisement is registered; unregister before reconfiguring".to_string(),
            ));
        }
        Ok(())
    }

    pub fn set_local_name(&mut self, name: &str) -> Result<()> {
        self.ensure_mutable()?;
        self.advertisement.set_local_name(name);
        Ok(())
    }

    pub fn set_short_name(&mut self, name: &str) -> Result<()> {
        self.ensure_mutable()?;
        self.advertisement.set_short_name(name);
        Ok(())
    }

    pub fn set_service_uuids(&mut self, uuids: &[Uuid]) -> Result<()> {
        self.ensure_mutable()?;
        self.advertisement.set_service_uuids(uuids);
        Ok(())
    }

    pub fn add_manufacturer(&mut self, company: u16, data: Vec<u8>) -> Result<()> {
        self.ensure_mutable()?;
        self.advertisement.add_manufacturer(company, data);
        Ok(())
    }

    pub fn add_service_data(&mut self, service: u16, data: Vec<u8>) -> Result<()> {
        self.ensure_mutable()?;
        self.advertisement.add_service_data(service, data);
        Ok(())
    }

    /// Accumulate a scanned or configured record into the advertisement.
    pub fn merge_advertisement(&mut self, record: &AdvRecord) -> Result<()> {
        self.ensure_mutable()?;
        self.advertisement.merge(record);
        Ok(())
    }

    /// Accumulate a record into the scan response.
    pub fn merge_scan_response(&mut self, record: &AdvRecord) -> Result<()> {
        self.ensure_mutable()?;
        self.scan_response.merge(record);
        Ok(())
    }

    /// Request the static-address workaround after registration.
    pub fn set_pinned_address(&mut self, address: Option<BDAddr>) -> Result<()> {
        self.ensure_mutable()?;
        self.pinned_address = address;
        Ok(())
    }

    pub fn advertisement(&self) -> &AdvRecord {
        &self.advertisement
    }

    pub fn scan_response(&self) -> &AdvRecord {
        &self.scan_response
    }

    /// Acquire the local controller and power it on.
    pub async fn initialize(&self) -> Result<()> {
        self.adapter.set_powered(true).await?;
        info!("adapter {} powered on", self.adapter.name());
        Ok(())
    }

    /// Lay the records out, program the controller and start advertising.
    /// A second call while registered is a no-op.
    pub async fn register(&mut self) -> Result<()> {
        if self.registered {
            debug!("advertisement already registered");
            return Ok(());
        }
        let (adv_pdu, scan_pdu) = layout(&self.advertisement, &self.scan_response)?;
        debug!("advertisement PDU: {}", hex::encode(&adv_pdu));
        debug!("scan response PDU: {}", hex::encode(&scan_pdu));

        // the stack's own advertising would fight over the air time
        self.mgmt
            .advertising(false)
            .await
            .map_err(|err| Error::RegistrationFailed(err.to_string()))?;

        if let Some(name) = self.advertisement.local_name() {
            info!("setting device name: {}", name);
            let name = name.to_string();
            if let Err(err) = self.mgmt.set_name(&name).await {
                warn!("unable to set controller name: {}", err);
            }
            if let Err(err) = self.adapter.set_alias(name).await {
                warn!("unable to set adapter alias: {}", err);
            }
        }

        self.mgmt
            .add_advertisement(ADV_INSTANCE, &adv_pdu, &scan_pdu)
            .await
            .map_err(|err| Error::RegistrationFailed(err.to_string()))?;

        if let Some(address) = self.pinned_address {
            info!("pinning advertising address to {}", address);
            if let Err(err) = self.mgmt.set_advertising_address(ADV_INSTANCE, address).await {
                warn!("unable to pin advertising address: {}", err);
            }
        }

        self.registered = true;
        info!("advertisement registered");
        Ok(())
    }

    /// Stop advertising and release the instance. Errors on this path are
    /// logged, not propagated, so shutdown always makes progress.
    pub async fn unregister(&mut self) {
        if !self.registered {
            return;
        }
        if let Err(err) = self.mgmt.clear_advertisements().await {
            error!("unable to clear advertising instances: {}", err);
        }
        self.registered = false;
        info!("advertisement unregistered");
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }
}

/// Fit both records into one advertisement PDU and one scan response PDU.
///
/// Fields are laid out greedily in [`PRIORITY`] order; a field that does
/// not fit the advertisement goes into the scan response. A complete
/// local name that fits neither PDU is truncated into a shortened name
/// (AD type 0x08) instead, unless the caller already provided one. Any
/// other single field above 31 octets is fatal.
pub fn layout(advertisement: &AdvRecord, scan_response: &AdvRecord) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut adv_pdu: Vec<u8> = Vec::new();
    let mut scan_pdu: Vec<u8> = Vec::new();
    let mut short_name_placed = advertisement.get(AD_NAME_SHORT).is_some();

    for (ad_type, value) in ordered_fields(advertisement) {
        for field in codec::encode_value(ad_type, value)? {
            if adv_pdu.len() + field.len() <= MAX_AD_LEN {
                adv_pdu.extend_from_slice(&field);
            } else if scan_pdu.len() + field.len() <= MAX_AD_LEN {
                debug!(
                    "AD type {:#04x} does not fit the advertisement, moving to scan response",
                    ad_type
                );
                scan_pdu.extend_from_slice(&field);
            } else if ad_type == AD_NAME_COMPLETE {
                if short_name_placed {
                    warn!("complete local name fits neither PDU, relying on the shortened name");
                    continue;
                }
                let AdValue::Name(name) = value else {
                    return Err(Error::AdvTooLarge(field.len()));
                };
                place_shortened_name(name, &mut adv_pdu, &mut scan_pdu)?;
                short_name_placed = true;
            } else {
                return Err(Error::AdvTooLarge(field.len()));
            }
        }
    }

    // the dedicated scan-response record comes after any overflow
    for (ad_type, value) in ordered_fields(scan_response) {
        for field in codec::encode_value(ad_type, value)? {
            if field.len() > MAX_AD_LEN {
                return Err(Error::AdvTooLarge(field.len()));
            }
            if scan_pdu.len() + field.len() <= MAX_AD_LEN {
                scan_pdu.extend_from_slice(&field);
            } else {
                warn!(
                    "dropping scan response field with AD type {:#04x}: no space left",
                    ad_type
                );
            }
        }
    }

    Ok((adv_pdu, scan_pdu))
}

/// Truncate a name that fits neither PDU into a shortened-name field in
/// whichever PDU has more room (preferring the scan response on a tie).
fn place_shortened_name(name: &str, adv_pdu: &mut Vec<u8>, scan_pdu: &mut Vec<u8>) -> Result<()> {
    let adv_room = MAX_AD_LEN - adv_pdu.len();
    let scan_room = MAX_AD_LEN - scan_pdu.len();
    let (target, room) = if scan_room >= adv_room {
        (scan_pdu, scan_room)
    } else {
        (adv_pdu, adv_room)
    };
    if room < 3 {
        return Err(Error::AdvTooLarge(name.len() + 2));
    }
    let mut cut = room - 2;
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    warn!(
        "local name truncated to {:?} to fit the 31 octet limit",
        &name[..cut]
    );
    for field in codec::encode_value(AD_NAME_SHORT, &AdValue::Name(name[..cut].to_string()))? {
        target.extend_from_slice(&field);
    }
    Ok(())
}

/// The record's fields with the known AD types brought into layout
/// priority order and everything else appended in record order.
fn ordered_fields(record: &AdvRecord) -> Vec<(u8, &AdValue)> {
    let mut fields: Vec<(u8, &AdValue)> = Vec::new();
    for ad_type in PRIORITY {
        if let Some(value) = record.get(ad_type) {
            fields.push((ad_type, value));
        }
    }
    for (ad_type, value) in record.iter() {
        if !PRIORITY.contains(&ad_type) {
            fields.push((ad_type, value));
        }
    }
    fields
}
