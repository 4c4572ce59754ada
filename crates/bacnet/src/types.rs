use std::{
    fmt,
    net::{
        IpAddr,
        SocketAddr,
    },
};

use anyhow::Context as _;

/// BACnet object types this agent reads from. Codes per the BACnet standard
/// object-type enumeration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectType {
    AnalogInput,
    AnalogOutput,
    AnalogValue,
    BinaryInput,
    Device,
}

impl ObjectType {
    pub fn code(&self) -> u16 {
        match self {
            ObjectType::AnalogInput => 0,
            ObjectType::AnalogOutput => 1,
            ObjectType::AnalogValue => 2,
            ObjectType::BinaryInput => 3,
            ObjectType::Device => 8,
        }
    }
}

/// Property identifiers, per the BACnet property enumeration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PropertyId {
    ObjectName,
    PresentValue,
    StatusFlags,
    Units,
}

impl PropertyId {
    pub fn code(&self) -> u32 {
        match self {
            PropertyId::ObjectName => 77,
            PropertyId::PresentValue => 85,
            PropertyId::StatusFlags => 111,
            PropertyId::Units => 117,
        }
    }
}

/// One property read against one object instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReadRequest {
    pub object_type: ObjectType,
    pub instance: u32,
    pub property: PropertyId,
}

impl fmt::Display for ReadRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:?}/{}/{:?}",
            self.object_type, self.instance, self.property
        )
    }
}

/// A decoded application-tagged value from a ReadProperty acknowledgement.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BacnetValue {
    Null,
    Boolean(bool),
    Unsigned(u64),
    Signed(i64),
    Real(f32),
    Double(f64),
    Enumerated(u32),
}

impl BacnetValue {
    /// Numeric view for the collection path; `Null` has none.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            BacnetValue::Null => None,
            BacnetValue::Boolean(b) => Some(if b { 1.0 } else { 0.0 }),
            BacnetValue::Unsigned(u) => Some(u as f64),
            BacnetValue::Signed(i) => Some(i as f64),
            BacnetValue::Real(r) => Some(f64::from(r)),
            BacnetValue::Double(d) => Some(d),
            BacnetValue::Enumerated(e) => Some(f64::from(e)),
        }
    }
}

/// Resolves a meter's configured endpoint into a socket address.
pub fn device_address(ip: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let ip: IpAddr = ip
        .parse()
        .with_context(|| format!("invalid meter address {ip}"))?;
    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_as_f64() {
        assert_eq!(BacnetValue::Real(12.5).as_f64(), Some(12.5));
        assert_eq!(BacnetValue::Unsigned(3).as_f64(), Some(3.0));
        assert_eq!(BacnetValue::Boolean(true).as_f64(), Some(1.0));
        assert_eq!(BacnetValue::Null.as_f64(), None);
    }

    #[test]
    fn device_address_rejects_garbage() {
        assert!(device_address("192.0.2.5", 47808).is_ok());
        assert!(device_address("not-an-ip", 47808).is_err());
    }
}
