// Seed data every member starts from

use crate::model::{Dataset, Product};

const SEED_PRODUCTS: &[(&str, &str, f64, u32)] = &[
    ("p-100", "Laptop", 1299.0, 25),
    ("p-101", "Mechanical Keyboard", 89.5, 120),
    ("p-102", "Wireless Mouse", 34.9, 200),
    ("p-103", "27\" Monitor", 329.0, 40),
    ("p-104", "USB-C Dock", 149.0, 60),
];

/// The inventory each member holds at process start
pub fn seed_dataset() -> Dataset {
    let mut dataset = Dataset::default();
    for (id, name, price, stock) in SEED_PRODUCTS {
        dataset.products.insert(
            id.to_string(),
            Product {
                id: id.to_string(),
                name: name.to_string(),
                price: *price,
                stock: *stock,
            },
        );
    }
    dataset
}
