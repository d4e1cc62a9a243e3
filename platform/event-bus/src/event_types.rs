//! Event type tags and producer sources used across the WMS services

pub const ORDER_RECEIVED: &str = "wms.order.received";
pub const ORDER_VALIDATED: &str = "wms.order.validated";
pub const ORDER_CANCELLED: &str = "wms.order.cancelled";
pub const ORDER_COMPLETED: &str = "wms.order.completed";

pub const WAVE_CREATED: &str = "wms.wave.created";
pub const WAVE_RELEASED: &str = "wms.wave.released";
pub const WAVE_COMPLETED: &str = "wms.wave.completed";

pub const ROUTE_CALCULATED: &str = "wms.routing.route-calculated";
pub const ROUTE_OPTIMIZED: &str = "wms.routing.route-optimized";

pub const PICK_TASK_ASSIGNED: &str = "wms.picking.task-assigned";
pub const ITEM_PICKED: &str = "wms.picking.item-picked";
pub const PICK_TASK_COMPLETED: &str = "wms.picking.task-completed";
pub const PICK_EXCEPTION: &str = "wms.picking.exception";

pub const CONSOLIDATION_STARTED: &str = "wms.consolidation.started";
pub const ITEM_CONSOLIDATED: &str = "wms.consolidation.item-consolidated";
pub const CONSOLIDATION_COMPLETED: &str = "wms.consolidation.completed";

pub const PACK_TASK_CREATED: &str = "wms.packing.task-created";
pub const PACKAGE_SEALED: &str = "wms.packing.package-sealed";
pub const PACK_TASK_COMPLETED: &str = "wms.packing.task-completed";

pub const SHIPMENT_CREATED: &str = "wms.shipping.shipment-created";
pub const SHIP_CONFIRMED: &str = "wms.shipping.confirmed";

pub const INVENTORY_RECEIVED: &str = "wms.inventory.received";
pub const INVENTORY_ADJUSTED: &str = "wms.inventory.adjusted";

pub const SHIFT_STARTED: &str = "wms.labor.shift-started";
pub const SHIFT_ENDED: &str = "wms.labor.shift-ended";
pub const LABOR_TASK_ASSIGNED: &str = "wms.labor.task-assigned";

/// `source` attribute per producing service
pub mod sources {
    pub const ORDER_MANAGEMENT: &str = "/wms/order-service";
    pub const WAVING: &str = "/wms/waving-service";
    pub const ROUTING: &str = "/wms/routing-service";
    pub const PICKING: &str = "/wms/picking-service";
    pub const CONSOLIDATION: &str = "/wms/consolidation-service";
    pub const PACKING: &str = "/wms/packing-service";
    pub const SHIPPING: &str = "/wms/shipping-service";
    pub const INVENTORY: &str = "/wms/inventory-service";
    pub const LABOR: &str = "/wms/labor-service";
}

/// Broker topics, one per owning service
pub mod topics {
    pub const ORDERS: &str = "orders.events";
    pub const WAVES: &str = "waves.events";
    pub const ROUTES: &str = "routes.events";
    pub const PICKING: &str = "picking.events";
    pub const CONSOLIDATION: &str = "consolidation.events";
    pub const PACKING: &str = "packing.events";
    pub const SHIPPING: &str = "shipping.events";
    pub const INVENTORY: &str = "inventory.events";
    pub const LABOR: &str = "labor.events";
}
