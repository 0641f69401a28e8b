use std::path::Path;
use std::sync::{Arc, Mutex};

use powerbank_rental::adapters::db::{open_connection, run_migrations, schema_version};
use powerbank_rental::app::SystemClock;
use powerbank_rental::app::services::{DirectoryCommandHandler, SqliteRentalService};
use powerbank_rental::domain::models::{NewPowerBank, NewStation, NewUser, UserProfile};
use powerbank_rental::domain::rental_state::Clock;

fn main() {
    if let Err(error) = run() {
        eprintln!("failed to create test db: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let mut path = if cfg!(windows) {
        ".\\data\\powerbank_test.db".to_string()
    } else {
        "./data/powerbank_test.db".to_string()
    };
    let mut force = false;
    let mut seed = false;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut index = 0;
    while index < args.len() {
        match args[index].as_str() {
            "--path" => {
                let Some(value) = args.get(index + 1) else {
                    return Err("--path requires a value".to_string());
                };
                path = value.clone();
                index += 2;
            }
            "--force" => {
                force = true;
                index += 1;
            }
            "--seed" => {
                seed = true;
                index += 1;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                return Err(format!("unknown argument: {other}"));
            }
        }
    }

    let path_ref = Path::new(&path);
    if let Some(parent) = path_ref.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|error| format!("failed to create parent directory: {error}"))?;
    }

    if force && path_ref.exists() {
        std::fs::remove_file(path_ref)
            .map_err(|error| format!("failed to remove existing db file: {error}"))?;
    }

    let mut connection = open_connection(&path).map_err(|error| error.to_string())?;
    run_migrations(&mut connection).map_err(|error| error.to_string())?;
    let version = schema_version(&connection).map_err(|error| error.to_string())?;

    println!("created/updated test db at: {path}");
    println!("schema version: {version}");

    if seed {
        let service = SqliteRentalService::new(Arc::new(Mutex::new(connection)));
        seed_demo_data(&service).map_err(|error| format!("failed to seed demo data: {error}"))?;
    }

    Ok(())
}

fn seed_demo_data(service: &SqliteRentalService) -> Result<(), String> {
    let now = SystemClock.now();

    let admin = service
        .register_user(&NewUser {
            username: "admin".to_string(),
            email: "admin@example.com".to_string(),
            balance_cents: 0,
            is_admin: true,
            profile: UserProfile::default(),
            created_at: now,
        })
        .map_err(|error| error.to_string())?;
    let rider = service
        .register_user(&NewUser {
            username: "rider".to_string(),
            email: "rider@example.com".to_string(),
            balance_cents: 1_000,
            is_admin: false,
            profile: UserProfile {
                first_name: Some("Demo".to_string()),
                last_name: Some("Rider".to_string()),
                ..UserProfile::default()
            },
            created_at: now,
        })
        .map_err(|error| error.to_string())?;

    let stations = [("Central Station", "Main hall", 6), ("Library", "North entrance", 4)];
    let mut serial = 1;
    for (name, location, capacity) in stations {
        let station = service
            .create_station(&NewStation {
                name: name.to_string(),
                location: location.to_string(),
                capacity,
                created_at: now,
            })
            .map_err(|error| error.to_string())?;

        for _ in 0..capacity / 2 {
            service
                .create_power_bank(&NewPowerBank {
                    station_id: station.id,
                    serial_number: format!("PB-{serial:04}"),
                    capacity_mah: Some(10_000),
                    current_charge_mah: Some(10_000),
                    created_at: now,
                })
                .map_err(|error| error.to_string())?;
            serial += 1;
        }

        println!("seeded station {} ({name})", station.id);
    }

    println!("admin user id: {}", admin.id);
    println!("rider user id: {}", rider.id);
    Ok(())
}

fn print_help() {
    println!("create_test_db");
    println!();
    println!("Usage:");
    println!("  cargo run --bin create_test_db -- [--path <file>] [--force] [--seed]");
    println!();
    println!("Options:");
    println!("  --path <file>   target sqlite file (default: ./data/powerbank_test.db)");
    println!("                  on Windows the default is .\\data\\powerbank_test.db");
    println!("  --force         delete existing file before creating");
    println!("  --seed          insert demo stations, power banks and an admin user");
}
