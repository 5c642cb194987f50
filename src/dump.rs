//! Listing the contents of an existing image.

use std::fs;
use std::path::Path;

use crate::header::ImageHeader;
use crate::layout::ImageLayout;
use crate::tlv::{TlvRegion, TlvTag};
use crate::trailer::{find_boot_magic, parse_boot_magic, BOOT_MAGIC_SIZE};
use crate::{align_up, Endian, ImageError, Result};

/// One TLV record, copied out of the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvEntry {
    pub tag: TlvTag,
    pub offset: usize,
    pub value: Vec<u8>,
}

/// What the end of the slot says, when the image was padded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailerInfo {
    pub magic_offset: usize,
    pub max_align: u32,
    /// Raw `image_ok` byte.
    pub image_ok: u8,
}

#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub endian: Endian,
    pub header: ImageHeader,
    pub size: usize,
    pub protected: Vec<TlvEntry>,
    pub unprotected: Vec<TlvEntry>,
    pub trailer: Option<TrailerInfo>,
}

fn entries(buf: &[u8], region: &TlvRegion, endian: Endian) -> Result<Vec<TlvEntry>> {
    region
        .records(buf, endian)
        .map(|r| {
            r.map(|r| TlvEntry {
                tag: r.tag,
                offset: r.offset,
                value: r.value.to_vec(),
            })
        })
        .collect()
}

pub fn read_image_info(buf: &[u8]) -> Result<ImageInfo> {
    let layout = ImageLayout::scan(buf)?;
    let endian = layout.endian;
    let protected = match &layout.protected {
        Some(region) => entries(buf, region, endian)?,
        None => Vec::new(),
    };
    let unprotected = entries(buf, &layout.unprotected, endian)?;

    let trailer = find_boot_magic(buf, endian).and_then(|magic_offset| {
        let max_align = parse_boot_magic(&buf[magic_offset..], endian)?;
        let from_end = align_up(BOOT_MAGIC_SIZE, max_align as usize) + max_align as usize;
        let at = buf.len().checked_sub(from_end)?;
        Some(TrailerInfo {
            magic_offset,
            max_align,
            image_ok: buf[at],
        })
    });

    Ok(ImageInfo {
        endian,
        header: layout.header,
        size: buf.len(),
        protected,
        unprotected,
        trailer,
    })
}

pub fn read_image_file(path: impl AsRef<Path>) -> Result<ImageInfo> {
    let path = path.as_ref();
    let buf = fs::read(path)?;
    if buf.is_empty() {
        return Err(ImageError::EmptyInput(path.display().to_string()));
    }
    read_image_info(&buf)
}

fn print_size(label: &str, size: usize) {
    if size >= 1024 * 1024 {
        println!(
            "{label}{} Bytes = {:.2} MiB = {:.2} KiB",
            size,
            size as f64 / (1024.0 * 1024.0),
            size as f64 / 1024.0,
        );
    } else if size >= 1024 {
        println!("{label}{} Bytes = {:.2} KiB", size, size as f64 / 1024.0);
    } else {
        println!("{label}{} Bytes", size);
    }
}

fn print_tlvs(title: &str, list: &[TlvEntry]) {
    println!("{title}");
    for e in list {
        let name = match e.tag {
            TlvTag::Known(t) => t.short_name().to_string(),
            TlvTag::Vendor(v) => format!("0x{v:04x}"),
        };
        let shown = if e.value.len() > 32 {
            format!("{}... ({} bytes)", hex::encode(&e.value[..32]), e.value.len())
        } else {
            hex::encode(&e.value)
        };
        println!("    0x{:06x}  {:<16} {}", e.offset, name, shown);
    }
}

pub fn print_image_info(info: &ImageInfo) {
    let hdr = &info.header;
    println!("Byte Order:   {}", info.endian);
    println!("Version:      {}", hdr.version);
    println!("Header Size:  0x{:x}", hdr.hdr_size);
    print_size("Payload Size: ", hdr.img_size as usize);
    print_size("Image Size:   ", info.size);
    println!("Load Address: 0x{:08x}", hdr.load_addr);
    let flags = hdr.flag_names();
    if flags.is_empty() {
        println!("Flags:        none");
    } else {
        println!("Flags:        {}", flags.join(" "));
    }

    if !info.protected.is_empty() {
        print_tlvs("Protected TLVs:", &info.protected);
    }
    print_tlvs("TLVs:", &info.unprotected);

    match info.trailer {
        Some(t) => {
            println!(
                "Trailer:      boot magic at 0x{:x} (max align {}), image_ok 0x{:02x}",
                t.magic_offset, t.max_align, t.image_ok
            );
        }
        None => println!("Trailer:      none"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
