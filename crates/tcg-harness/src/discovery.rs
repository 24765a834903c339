//! Level 0 Discovery blob builder.

use tcg_proto::discovery::{LockingFeatures, SingleUserModeFlags, TperFeatures, feature};

/// Descriptor version byte used for every feature.
const DESCRIPTOR_VERSION: u8 = 0x10;

/// Builds Level 0 Discovery responses.
#[derive(Debug, Clone)]
pub struct DiscoveryBuilder {
    version: u32,
    vendor: [u8; 32],
    descriptors: Vec<u8>,
}

impl Default for DiscoveryBuilder {
    fn default() -> Self {
        Self { version: 1, vendor: [0; 32], descriptors: Vec::new() }
    }
}

impl DiscoveryBuilder {
    /// Header only, version 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enterprise drive with two ComIDs starting at `base_com_id`.
    pub fn enterprise(base_com_id: u16) -> Self {
        Self::new().capable_tper().capable_locking().ssc(feature::ENTERPRISE_SSC, base_com_id, 2)
    }

    /// Opal v2 drive with 4 admins, 8 users and Single User Mode.
    pub fn opal_v2(base_com_id: u16) -> Self {
        Self::new()
            .capable_tper()
            .capable_locking()
            .opal_v2_feature(base_com_id, 1, 4, 8)
            .single_user_mode(9, SingleUserModeFlags::empty())
    }

    /// Override the data structure version.
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Report a security life-cycle state in the vendor bytes.
    pub fn life_cycle_state(mut self, state: u8) -> Self {
        self.vendor[0] = 0x01;
        self.vendor[1] = state;
        self
    }

    /// TPer descriptor.
    pub fn tper(self, flags: TperFeatures) -> Self {
        self.feature(feature::TPER, &[flags.bits()])
    }

    /// TPer descriptor with Sync and Streaming.
    pub fn capable_tper(self) -> Self {
        self.tper(TperFeatures::SYNC | TperFeatures::STREAMING | TperFeatures::COM_ID_MANAGEMENT)
    }

    /// Locking descriptor.
    pub fn locking(self, flags: LockingFeatures) -> Self {
        self.feature(feature::LOCKING, &[flags.bits()])
    }

    /// Locking descriptor with locking supported and media encryption.
    pub fn capable_locking(self) -> Self {
        self.locking(LockingFeatures::LOCKING_SUPPORTED | LockingFeatures::MEDIA_ENCRYPTION)
    }

    /// Enterprise or Opal v1 SSC descriptor.
    pub fn ssc(self, code: u16, base_com_id: u16, com_id_count: u16) -> Self {
        let mut body = Vec::with_capacity(16);
        body.extend_from_slice(&base_com_id.to_be_bytes());
        body.extend_from_slice(&com_id_count.to_be_bytes());
        body.resize(16, 0);
        self.feature(code, &body)
    }

    /// Opal SSC v2 descriptor.
    pub fn opal_v2_feature(self, base_com_id: u16, com_id_count: u16, admins: u16, users: u16) -> Self {
        let mut body = Vec::with_capacity(16);
        body.extend_from_slice(&base_com_id.to_be_bytes());
        body.extend_from_slice(&com_id_count.to_be_bytes());
        body.push(0);
        body.extend_from_slice(&admins.to_be_bytes());
        body.extend_from_slice(&users.to_be_bytes());
        body.resize(16, 0);
        self.feature(feature::OPAL_SSC_V2, &body)
    }

    /// Single User Mode descriptor.
    pub fn single_user_mode(self, locking_objects: u32, flags: SingleUserModeFlags) -> Self {
        let mut body = Vec::with_capacity(12);
        body.extend_from_slice(&locking_objects.to_be_bytes());
        body.push(flags.bits());
        body.resize(12, 0);
        self.feature(feature::SINGLE_USER_MODE, &body)
    }

    /// Any descriptor, body verbatim.
    ///
    /// Bodies longer than 255 bytes are cut to 255.
    pub fn feature(mut self, code: u16, body: &[u8]) -> Self {
        let body = &body[..body.len().min(usize::from(u8::MAX))];
        self.descriptors.extend_from_slice(&code.to_be_bytes());
        self.descriptors.push(DESCRIPTOR_VERSION);
        self.descriptors.push(body.len() as u8);
        self.descriptors.extend_from_slice(body);
        self
    }

    /// Header plus descriptors.
    pub fn build(&self) -> Vec<u8> {
        let parameter_length = (44 + self.descriptors.len()) as u32;
        let mut blob = Vec::with_capacity(48 + self.descriptors.len());
        blob.extend_from_slice(&parameter_length.to_be_bytes());
        blob.extend_from_slice(&self.version.to_be_bytes());
        blob.extend_from_slice(&[0; 8]);
        blob.extend_from_slice(&self.vendor);
        blob.extend_from_slice(&self.descriptors);
        blob
    }
}
