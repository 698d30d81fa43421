//! The fixed schema used by the sales/HR sample data set.

use serde::{Deserialize, Serialize};

use crate::schema::TableDefinition;

/// Which shape of `products` to create.
///
/// The sample data set describes `products` twice, once with a
/// `stock_quantity` column and once without it.  Both cannot exist under the
/// same name, so callers pick one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductsVariant {
    WithStock,
    WithoutStock,
}

/// Every default table, in declaration order.
pub fn default_tables(variant: ProductsVariant) -> Vec<TableDefinition> {
    vec![
        users(),
        products(variant),
        sales(),
        employees(),
        customers(),
        skills(),
        employee_skills(),
        orders(),
    ]
}

pub fn users() -> TableDefinition {
    TableDefinition::new("users")
        .column("id SERIAL PRIMARY KEY")
        .column("fname VARCHAR(50) NOT NULL")
        .column("lname VARCHAR(50) NOT NULL")
        .column("age INT")
        .column("created_at TIMESTAMP DEFAULT NOW()")
}

pub fn products(variant: ProductsVariant) -> TableDefinition {
    let table = TableDefinition::new("products")
        .column("product_id INT PRIMARY KEY")
        .column("product_name VARCHAR(100)")
        .column("category VARCHAR(50)")
        .column("unit_price DECIMAL(10, 2)");
    match variant {
        ProductsVariant::WithStock => table.column("stock_quantity INT"),
        ProductsVariant::WithoutStock => table,
    }
}

pub fn sales() -> TableDefinition {
    TableDefinition::new("sales")
        .column("sale_id INT PRIMARY KEY")
        .column("product_id INT")
        .column("quantity_sold INT")
        .column("sale_date DATE")
        .column("total_price DECIMAL(10, 2)")
        .foreign_key("product_id", "products", "product_id")
}

pub fn employees() -> TableDefinition {
    TableDefinition::new("employees")
        .column("employee_id INT PRIMARY KEY")
        .column("first_name VARCHAR(50)")
        .column("last_name VARCHAR(50)")
        .column("email VARCHAR(100)")
        .column("phone_number VARCHAR(20)")
        .column("hire_date DATE")
        .column("job_id VARCHAR(10)")
        .column("salary DECIMAL(10,2)")
}

pub fn customers() -> TableDefinition {
    TableDefinition::new("customers")
        .column("customer_id INT PRIMARY KEY")
        .column("first_name VARCHAR(50)")
        .column("last_name VARCHAR(50)")
        .column("email VARCHAR(100)")
        .column("phone VARCHAR(20)")
        .column("address VARCHAR(100)")
        .column("city VARCHAR(50)")
        .column("state VARCHAR(50)")
        .column("zip_code VARCHAR(20)")
        .column("registration_date DATE")
}

pub fn skills() -> TableDefinition {
    TableDefinition::new("skills")
        .column("skill_id INT PRIMARY KEY")
        .column("skill_name VARCHAR(50)")
        .column("skill_category VARCHAR(50)")
}

pub fn employee_skills() -> TableDefinition {
    TableDefinition::new("employee_skills")
        .column("employee_id INT")
        .column("skill_id INT")
        .column("proficiency_level VARCHAR(20)")
        .column("certification_date DATE NULL")
        .primary_key(["employee_id", "skill_id"])
        .foreign_key("employee_id", "employees", "employee_id")
        .foreign_key("skill_id", "skills", "skill_id")
}

pub fn orders() -> TableDefinition {
    TableDefinition::new("orders")
        .column("order_id INT PRIMARY KEY")
        .column("customer_id INT")
        .column("order_date DATE")
        .column("status VARCHAR(20)")
        .column("total_amount DECIMAL(12,2)")
        .foreign_key("customer_id", "customers", "customer_id")
}
