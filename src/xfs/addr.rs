//! Address-space converter: pure arithmetic between the address forms
//! of the data and realtime devices. Input components are validated
//! against a combination table, converted to byte offsets, summed, and
//! the sum is projected onto the requested output form.

use crate::error::FxfsrError;
use crate::xfs::geometry::FsGeometry;

/// Address forms the converter understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrType {
    // Data device.
    Byte,
    Daddr,
    Fsblock,
    Agnumber,
    Agblock,
    Inoidx,
    Ino,
    // Realtime device.
    Rtblock,
    Rtx,
    Rbmblock,
    Rbmword,
    Rsumlog,
    Rsuminfo,
    Rsumblock,
}

/// One input component: a typed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrInput {
    pub ty: AddrType,
    pub value: u64,
}

impl AddrInput {
    pub fn new(ty: AddrType, value: u64) -> Self {
        AddrInput { ty, value }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Device {
    Data,
    Rt,
}

impl AddrType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Byte => "byte",
            Self::Daddr => "daddr",
            Self::Fsblock => "fsblock",
            Self::Agnumber => "agnumber",
            Self::Agblock => "agblock",
            Self::Inoidx => "inoidx",
            Self::Ino => "inode",
            Self::Rtblock => "rtblock",
            Self::Rtx => "rtextent",
            Self::Rbmblock => "rbmblock",
            Self::Rbmword => "rbmword",
            Self::Rsumlog => "rsumlog",
            Self::Rsuminfo => "rsuminfo",
            Self::Rsumblock => "rsumblock",
        }
    }

    fn device(self) -> Device {
        match self {
            Self::Byte | Self::Daddr | Self::Fsblock | Self::Agnumber | Self::Agblock
            | Self::Inoidx | Self::Ino => Device::Data,
            _ => Device::Rt,
        }
    }

    /// Which other types may appear alongside this one in a single
    /// expression.
    fn combines_with(self, other: AddrType) -> bool {
        use AddrType::*;
        match self {
            Agnumber => matches!(other, Agblock | Inoidx),
            Agblock => matches!(other, Agnumber | Inoidx),
            Inoidx => matches!(other, Agnumber | Agblock),
            Rbmblock => matches!(other, Rbmword),
            Rbmword => matches!(other, Rbmblock),
            Rsumlog => matches!(other, Rsuminfo | Rsumblock),
            Rsuminfo | Rsumblock => matches!(other, Rsumlog),
            _ => false,
        }
    }

    /// Realtime summary context types must arrive in this order, since
    /// each depends on the levels supplied before it.
    fn rsum_order(self) -> Option<u8> {
        match self {
            Self::Rsumlog => Some(0),
            Self::Rsuminfo | Self::Rsumblock => Some(1),
            _ => None,
        }
    }
}

/// Convert `inputs` (summed) to the address form `out`.
pub fn convert(geo: &FsGeometry, inputs: &[AddrInput], out: AddrType) -> Result<u64, FxfsrError> {
    if inputs.is_empty() {
        return Err(FxfsrError::InvalidArgument("no address components given".into()));
    }

    let device = inputs[0].ty.device();
    if out.device() != device {
        return Err(FxfsrError::InvalidArgument(format!(
            "cannot convert {} address to {}",
            inputs[0].ty.name(),
            out.name()
        )));
    }

    let mut last_rsum_order: Option<u8> = None;
    for (i, input) in inputs.iter().enumerate() {
        if input.ty.device() != device {
            return Err(FxfsrError::InvalidArgument(format!(
                "{} and {} address different devices",
                inputs[0].ty.name(),
                input.ty.name()
            )));
        }
        for other in &inputs[i + 1..] {
            if other.ty == input.ty {
                return Err(FxfsrError::InvalidArgument(format!(
                    "duplicate {} component",
                    input.ty.name()
                )));
            }
            if !input.ty.combines_with(other.ty) {
                return Err(FxfsrError::InvalidArgument(format!(
                    "{} cannot be combined with {}",
                    input.ty.name(),
                    other.ty.name()
                )));
            }
        }
        if let Some(ord) = input.ty.rsum_order() {
            if let Some(prev) = last_rsum_order {
                if ord < prev {
                    return Err(FxfsrError::InvalidArgument(format!(
                        "{} must precede later summary components",
                        AddrType::Rsumlog.name()
                    )));
                }
            }
            last_rsum_order = Some(ord);
        }
    }

    let mut bytes = 0u64;
    let mut rsumlog: Option<u64> = None;
    for input in inputs {
        bytes = bytes
            .checked_add(component_bytes(geo, input, &mut rsumlog)?)
            .ok_or_else(|| FxfsrError::InvalidArgument("address overflow".into()))?;
    }

    project(geo, bytes, out, rsumlog)
}

/// Byte contribution of one component.
fn component_bytes(
    geo: &FsGeometry,
    input: &AddrInput,
    rsumlog: &mut Option<u64>,
) -> Result<u64, FxfsrError> {
    let v = input.value;
    Ok(match input.ty {
        AddrType::Byte => v,
        AddrType::Daddr => v << 9,
        AddrType::Fsblock => {
            let (agno, agblock) = geo.fsb_to_agblock(v);
            geo.ag_block_to_byte(agno, agblock)
        }
        AddrType::Agnumber => v * geo.ag_blocks as u64 * geo.block_size as u64,
        AddrType::Agblock => v << geo.block_log as u64,
        AddrType::Inoidx => v * geo.inode_size as u64,
        AddrType::Ino => {
            let agno = geo.ino_to_agno(v);
            let agino = geo.ino_to_agino(v);
            geo.ag_block_to_byte(agno, geo.agino_to_agblock(agino))
                + (agino as u64 & ((1u64 << geo.inop_blog) - 1)) * geo.inode_size as u64
        }
        AddrType::Rtblock => v << geo.block_log as u64,
        AddrType::Rtx => (v * geo.rext_size as u64) << geo.block_log as u64,
        AddrType::Rbmblock => v << geo.block_log as u64,
        AddrType::Rbmword => v * 4,
        AddrType::Rsumlog => {
            *rsumlog = Some(v);
            v * geo.rbm_blocks as u64 * 4
        }
        AddrType::Rsuminfo => v * 4,
        AddrType::Rsumblock => v * 4,
    })
}

/// Project a summed byte offset onto the output form.
fn project(
    geo: &FsGeometry,
    bytes: u64,
    out: AddrType,
    rsumlog: Option<u64>,
) -> Result<u64, FxfsrError> {
    let block_size = geo.block_size as u64;
    Ok(match out {
        AddrType::Byte => bytes,
        AddrType::Daddr => bytes >> 9,
        AddrType::Fsblock => {
            let abs_block = bytes >> geo.block_log as u64;
            let agno = abs_block / geo.ag_blocks as u64;
            let agblock = abs_block % geo.ag_blocks as u64;
            geo.agblock_to_fsb(agno as u32, agblock as u32)
        }
        AddrType::Agnumber => (bytes >> geo.block_log as u64) / geo.ag_blocks as u64,
        AddrType::Agblock => (bytes >> geo.block_log as u64) % geo.ag_blocks as u64,
        AddrType::Inoidx => (bytes % block_size) / geo.inode_size as u64,
        AddrType::Ino => {
            let abs_block = bytes >> geo.block_log as u64;
            let agno = (abs_block / geo.ag_blocks as u64) as u32;
            let agblock = (abs_block % geo.ag_blocks as u64) as u32;
            let slot = (bytes % block_size) / geo.inode_size as u64;
            let agino = ((agblock as u64) << geo.inop_blog) | slot;
            geo.agino_to_ino(agno, agino as u32)
        }
        AddrType::Rtblock => bytes >> geo.block_log as u64,
        AddrType::Rtx => (bytes >> geo.block_log as u64) / geo.rext_size.max(1) as u64,
        AddrType::Rbmblock => bytes >> geo.block_log as u64,
        AddrType::Rbmword => (bytes % block_size) / 4,
        AddrType::Rsumlog => {
            if geo.rbm_blocks == 0 {
                return Err(FxfsrError::InvalidArgument(
                    "filesystem has no realtime bitmap".into(),
                ));
            }
            (bytes / 4) / geo.rbm_blocks as u64
        }
        AddrType::Rsuminfo => bytes / 4,
        AddrType::Rsumblock => {
            // Level 0 summary entries map straight to word indexes; the
            // modulo below would divide by the bitmap length otherwise.
            match rsumlog {
                Some(0) | None => bytes / 4,
                Some(_) => {
                    if geo.rbm_blocks == 0 {
                        return Err(FxfsrError::InvalidArgument(
                            "filesystem has no realtime bitmap".into(),
                        ));
                    }
                    (bytes / 4) % geo.rbm_blocks as u64
                }
            }
        }
    })
}
