pub(crate) const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub(crate) const XADES_NS: &str = "http://uri.etsi.org/01903/v1.3.2#";
pub(crate) const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

pub const C14N_INCLUSIVE: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
pub const C14N_EXCLUSIVE: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
pub const SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
pub const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
pub const SIGNED_PROPERTIES_TYPE: &str = "http://uri.etsi.org/01903#SignedProperties";

pub(crate) const POLICY_IDENTIFIER: &str = "https://cdn.comprobanteselectronicos.go.cr/xml-schemas/v4.4/Resolucion_Comprobantes_Electronicos_DGT-R-48-2016.pdf";
pub(crate) const POLICY_DESCRIPTION: &str =
    "Politica de firma para Comprobantes Electronicos Costa Rica";
pub(crate) const POLICY_DIGEST: &str =
    "NmI5Njk1ZThkNzI0MmIzMGJmZDAyNDc4YjUwNzkzODM2NTBiOWUxNTBkMmI2YjgzYzZjM2I5NTZlNDQ4OWQzMQ==";

pub(crate) const DOCUMENT_NS_BASE: &str =
    "https://cdn.comprobanteselectronicos.go.cr/xml-schemas/v4.4/";
