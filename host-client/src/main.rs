// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

mod image;
mod link;
mod update;

use boot_protocol::{decode_version, Command};
use clap::{Parser, Subcommand};
use consts::{DEFAULT_BAUDRATE, PAGE_SIZE};
use image::PackedImage;
use link::BootLink;
use update::{CheckVerdict, Pacing};
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;
use tokio_serial::SerialPortBuilderExt;

fn parse_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

const CHECK_ATTEMPTS: u32 = 5;

fn report_check(verdict: CheckVerdict) -> Result<(), Box<dyn Error>> {
    match verdict {
        CheckVerdict::Launched => {
            println!("check ok, image launched");
            Ok(())
        }
        CheckVerdict::Rejected => Err("check failed, image rejected and autoboot disabled".into()),
        CheckVerdict::Pending => Err("check did not finish, device still verifying".into()),
    }
}

#[derive(Debug, Parser)]
struct Args {
    #[arg(short, long)]
    list_ports: bool,
    #[arg(short, long, default_value_t = String::from("/dev/ttyUSB0"))]
    port: String,
    #[arg(short, long, default_value_t = DEFAULT_BAUDRATE)]
    baudrate: u32,
    /// The device is already waiting for 272 byte frames
    #[arg(long)]
    data_frames: bool,
    /// Reply timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout: u64,
    /// Pause after each sector erase, in milliseconds
    #[arg(long, default_value_t = 500)]
    erase_settle: u64,
    /// Pause after each page write, in milliseconds
    #[arg(long, default_value_t = 5)]
    write_settle: u64,
    /// Time the device gets to verify an image before it is asked, in milliseconds
    #[arg(long, default_value_t = 1000)]
    check_wait: u64,
    #[command(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Dump whatever the device sends
    Listen {
        #[arg(default_value_t = 5)]
        seconds: u64,
    },
    /// Show boot mode and session flags
    Info,
    Reset,
    /// Keep the bootloader in charge after the next reset
    SaveBrick,
    EnterBoot,
    EnterApp,
    /// Set the length of the frames that follow (16 or 272)
    Next {
        length: u32,
    },
    Erase {
        #[arg(value_parser = parse_u32)]
        address: u32,
        #[arg(value_parser = parse_u32)]
        length: u32,
    },
    /// Write a file to flash, switching to data frames around it
    Write {
        #[arg(value_parser = parse_u32)]
        address: u32,
        file: PathBuf,
    },
    /// Write one page without touching the frame length
    WriteOnly {
        #[arg(value_parser = parse_u32)]
        address: u32,
        file: PathBuf,
    },
    Read {
        #[arg(value_parser = parse_u32)]
        address: u32,
        #[arg(value_parser = parse_u32)]
        length: u32,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Verify the stored image and launch it
    Check,
    /// Launch an already verified image
    Jump,
    /// Build the metadata page for a firmware binary
    Pack {
        file: PathBuf,
        version: semver::Version,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Erase, write and check a firmware binary
    Update {
        file: PathBuf,
        version: semver::Version,
        /// Leave the image unchecked
        #[arg(long)]
        no_check: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    pretty_env_logger::init();

    let args = Args::parse();

    if args.list_ports {
        let ports = tokio_serial::available_ports()?;
        println!("List of available serial ports:");
        for port in ports {
            println!("- {}", port.port_name);
        }
        return Ok(());
    }

    let Some(cmd) = args.cmd else {
        return Ok(());
    };

    if let Cmd::Pack { file, version, output } = &cmd {
        let packed = PackedImage::from_binary(&std::fs::read(file)?, version)?;
        let (major, minor, patch) = decode_version(packed.metadata.version);
        println!("version   {major}.{minor}.{patch}");
        println!("length    {}", packed.metadata.length);
        println!("checksum  {:#010x}", packed.metadata.checksum);
        println!("isr crc   {:#010x}", packed.metadata.isr_checksum);
        if let Some(output) = output {
            let page = packed.metadata.to_page().map_err(|e| e.to_string())?;
            std::fs::write(output, page)?;
        }
        return Ok(());
    }

    let pacing = Pacing {
        erase_settle: Duration::from_millis(args.erase_settle),
        write_settle: Duration::from_millis(args.write_settle),
    };
    let check_wait = Duration::from_millis(args.check_wait);

    let serial = tokio_serial::new(&args.port, args.baudrate).open_native_async()?;
    let mut link = BootLink::new(serial)
        .with_timeout(Duration::from_millis(args.timeout))
        .assume_data_frames(args.data_frames);

    match cmd {
        Cmd::Listen { seconds } => link.listen(Duration::from_secs(seconds)).await?,
        Cmd::Info => {
            let report = link.info().await?;
            println!("mode  {:?}", report.mode);
            println!("flags {:?}", report.flags);
        }
        Cmd::Reset => {
            link.command(Command::Reset, 0, 0).await?;
        }
        Cmd::SaveBrick => {
            link.command(Command::SaveBrick, 0, 0).await?;
        }
        Cmd::EnterBoot => {
            link.command(Command::EnterBoot, 0, 0).await?;
        }
        Cmd::EnterApp => {
            link.command(Command::EnterApp, 0, 0).await?;
        }
        Cmd::Next { length } => link.set_frame_length(length).await?,
        Cmd::Erase { address, length } => {
            update::erase_sectors(&mut link, address, length, &pacing).await?;
        }
        Cmd::Write { address, file } => {
            update::write_pages(&mut link, address, &std::fs::read(file)?, &pacing).await?;
        }
        Cmd::WriteOnly { address, file } => {
            let data = std::fs::read(file)?;
            let page = &data[..data.len().min(PAGE_SIZE)];
            link.data_command(Command::Write, address, page.len() as u32, page)
                .await?;
        }
        Cmd::Read {
            address,
            length,
            output,
        } => {
            let data = link.read_flash(address, length).await?;
            match output {
                Some(path) => std::fs::write(path, data)?,
                None => {
                    for (i, line) in data.chunks(16).enumerate() {
                        println!("{:08x}: {:02x?}", address as usize + i * 16, line);
                    }
                }
            }
        }
        Cmd::Check => report_check(update::check_image(&mut link, check_wait, CHECK_ATTEMPTS).await?)?,
        Cmd::Jump => {
            link.command(Command::Jump, 0, 0).await?;
        }
        Cmd::Update {
            file,
            version,
            no_check,
        } => {
            let packed = PackedImage::from_binary(&std::fs::read(file)?, &version)?;
            update::upload(&mut link, &packed, &pacing).await?;
            println!("update done, {} bytes", packed.metadata.length);
            if !no_check {
                report_check(update::check_image(&mut link, check_wait, CHECK_ATTEMPTS).await?)?;
            }
        }
        // Handled before the port is opened.
        Cmd::Pack { .. } => {}
    }

    Ok(())
}
